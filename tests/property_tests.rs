//! Property-based tests for VESPER
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Classification Properties
// ============================================================================

mod classify_properties {
    use super::*;
    use vesper_nathole::{NatBehavior, NatType, classify_nat_type};

    fn addr() -> impl Strategy<Value = (u8, u16)> {
        (0u8..4, 40_000u16..40_008)
    }

    proptest! {
        /// Any IP difference makes the NAT Hard, whatever the sample order
        #[test]
        fn ip_difference_is_hard_in_any_order(
            samples in prop::collection::vec(addr(), 2..8),
            rotate in 0usize..8,
        ) {
            let mut addrs: Vec<String> = samples
                .iter()
                .map(|(h, p)| format!("10.0.0.{h}:{p}"))
                .collect();
            let ip_differs = samples.iter().any(|(h, _)| *h != samples[0].0);
            let port_differs = samples.iter().any(|(_, p)| *p != samples[0].1);

            let len = addrs.len();
            addrs.rotate_left(rotate % len);
            let (nat_type, behavior) = classify_nat_type(&addrs).unwrap();

            prop_assert_eq!(nat_type == NatType::Hard, ip_differs || port_differs);
            if !ip_differs && !port_differs {
                prop_assert_eq!(behavior, NatBehavior::NoChange);
            }
            if ip_differs {
                prop_assert!(matches!(behavior, NatBehavior::IpChanged | NatBehavior::BothChanged));
            }
        }
    }
}

// ============================================================================
// Analyzer Properties
// ============================================================================

mod analyzer_properties {
    use super::*;
    use vesper_nathole::analysis::MAX_SCORE;
    use vesper_nathole::{AnalysisKey, Analyzer, NatBehavior, NatFeature, NatType};

    fn easy() -> NatFeature {
        NatFeature {
            nat_type: NatType::Easy,
            behavior: NatBehavior::NoChange,
            regular_ports_change: false,
            ports_difference: 0,
            public_network: false,
        }
    }

    proptest! {
        /// Successes saturate at the cap from any reachable start
        #[test]
        fn successes_converge_to_cap(failures in 0usize..=10, successes in 25usize..40) {
            let analyzer = Analyzer::new();
            let key = AnalysisKey::new(&easy(), &easy());
            let rec = analyzer.recommend(&key, &easy(), &easy());

            for _ in 0..failures {
                analyzer.report(&key, rec.mode, rec.index, false);
            }
            let mut score = None;
            for _ in 0..successes {
                score = analyzer.report(&key, rec.mode, rec.index, true);
                prop_assert!(score.unwrap() <= MAX_SCORE);
            }
            prop_assert_eq!(score, Some(MAX_SCORE));
        }

        /// The recommendation depends only on the report history
        #[test]
        fn recommend_is_reproducible(history in prop::collection::vec((0usize..6, any::<bool>()), 0..40)) {
            let run = || {
                let analyzer = Analyzer::new();
                let key = AnalysisKey::new(&easy(), &easy());
                let first = analyzer.recommend(&key, &easy(), &easy());
                for (index, success) in &history {
                    analyzer.report(&key, first.mode, *index, *success);
                }
                analyzer.recommend(&key, &easy(), &easy())
            };
            prop_assert_eq!(run(), run());
        }
    }
}

// ============================================================================
// Wire Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use vesper_nathole::controller::candidate_ports;
    use vesper_nathole::msg::{NatHoleDetectBehavior, NatHoleResp};
    use vesper_nathole::Message;

    proptest! {
        /// Candidate windows stay inside the port space, edges included
        #[test]
        fn candidate_ports_in_bounds(
            port in prop_oneof![Just(1u16), Just(65535u16), any::<u16>()],
            difference in any::<i32>(),
            range in any::<u16>(),
        ) {
            let windows = candidate_ports(port, difference, range);
            prop_assert_eq!(windows.is_empty(), range == 0);
            for w in windows {
                prop_assert!(1 <= w.from && w.from <= w.to);
            }
        }

        /// A response carries its candidate windows through the framing
        #[test]
        fn resp_roundtrip(
            port in any::<u16>(),
            difference in -10i32..10,
            range in 0u16..300,
            addrs in prop::collection::vec("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}:[0-9]{1,5}", 0..4),
        ) {
            let resp = NatHoleResp {
                transaction_id: "tx".into(),
                sid: "sid".into(),
                protocol: "kcp".into(),
                candidate_addrs: addrs,
                detect_behavior: NatHoleDetectBehavior {
                    candidate_ports: candidate_ports(port, difference, range),
                    read_timeout_ms: 5000,
                    ..NatHoleDetectBehavior::default()
                },
                ..NatHoleResp::default()
            };
            let msg = Message::Resp(resp);
            let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
