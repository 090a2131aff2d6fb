mod common;

use common::{standard_plan, Fixture};
use cutover_traffic::{RollbackReason, TrafficWeight};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Advance,
    Rollback,
    Resync,
    Lag(u64),
    RouterDown(bool),
    NewErrors(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Advance),
        1 => Just(Op::Rollback),
        1 => Just(Op::Resync),
        1 => (0..10u64).prop_map(Op::Lag),
        1 => any::<bool>().prop_map(Op::RouterDown),
        1 => (0..30u64).prop_map(Op::NewErrors),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_weight_always_sums_to_100(ops in proptest::collection::vec(op(), 1..40)) {
        runtime().block_on(async {
            let fx = Fixture::new(standard_plan());
            fx.healthy().await;
            let mut last_new_share = 0u8;
            let mut rolled_back = false;

            for op in ops {
                match op {
                    Op::Advance => {
                        let _ = fx.controller.advance_phase().await;
                    }
                    Op::Rollback => {
                        let _ = fx
                            .controller
                            .force_rollback(RollbackReason::ReplicationFailed)
                            .await;
                    }
                    Op::Resync => {
                        let _ = fx.controller.resync_routing().await;
                    }
                    Op::Lag(secs) => fx.settle_lag(Duration::from_secs(secs)).await,
                    Op::RouterDown(down) => fx.router.fail(down),
                    Op::NewErrors(per_mille) => {
                        fx.skip_health_window();
                        fx.settle_health(1, per_mille);
                    }
                }

                let weight = fx.controller.current_weight();
                prop_assert_eq!(u16::from(weight.old()) + u16::from(weight.new_share()), 100);

                let run = fx.controller.run();
                prop_assert_eq!(run.weight, weight);
                if run.rollback.is_some() {
                    rolled_back = true;
                }
                if rolled_back {
                    prop_assert_eq!(weight, TrafficWeight::ALL_OLD);
                } else {
                    prop_assert!(weight.new_share() >= last_new_share);
                    last_new_share = weight.new_share();
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
