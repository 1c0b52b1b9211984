mod common;

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use common::{Net, eager_context, solo};
use elastic::{
    Collective, ModelState, ObjectState, Result, RunConfig, State, StateErr, Tensor, Tracked,
    collective::{LocalCollective, LocalGroup},
    run, run_with,
};

/// A single-rank collective whose first `failures` broadcasts fail, counting every
/// call it receives.
struct Flaky {
    inner: LocalCollective,
    failures: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl Flaky {
    fn new(failures: usize) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = Self {
            inner: LocalGroup::new(NonZeroUsize::MIN).remove(0),
            failures: AtomicUsize::new(failures),
            calls: calls.clone(),
        };

        (flaky, calls)
    }

    fn tick(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing {
            return Err(StateErr::Collective("peer went away".to_string()));
        }

        Ok(())
    }
}

impl Collective for Flaky {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn broadcast(&self, values: &mut [Tensor], root_rank: usize) -> Result<()> {
        self.tick()?;
        self.inner.broadcast(values, root_rank)
    }

    fn broadcast_object(&self, obj: Vec<u8>, root_rank: usize) -> Result<Vec<u8>> {
        self.tick()?;
        self.inner.broadcast_object(obj, root_rank)
    }
}

#[test]
fn returns_the_training_result() {
    let net = Net::new(&[1.0], 0.0, &[0.0]);
    let mut state = ModelState::builder(solo(), net.model.clone()).build().unwrap();

    let out = run(
        &mut state,
        |state| {
            net.step(1.0);
            state.commit()?;
            Ok(net.weight.to_vec())
        },
        || panic!("no reset expected"),
    )
    .unwrap();

    assert_eq!(out, vec![2.0]);
}

#[test]
fn collective_failure_in_training_rolls_back() {
    let net = Net::new(&[1.0, 2.0], 0.0, &[0.0, 0.0]);
    let mut state = ModelState::builder(solo(), net.model.clone()).build().unwrap();

    let mut attempts = 0;
    let mut resets = 0;
    let mut seen_at_start = Vec::new();

    let out = run(
        &mut state,
        |_| {
            attempts += 1;
            seen_at_start.push(net.weight.to_vec());
            net.step(10.0);

            if attempts == 1 {
                return Err(StateErr::Collective("lost rank 3".to_string()));
            }

            Ok(net.weight.to_vec())
        },
        || {
            resets += 1;
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(out, vec![11.0, 12.0]);
    assert_eq!(resets, 1);
    assert_eq!(seen_at_start, vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
}

#[test]
fn collective_failure_in_sync_is_retried() {
    let (flaky, calls) = Flaky::new(1);
    let net = Net::new(&[4.0], 0.0, &[0.0]);
    let mut state = ModelState::builder(eager_context(flaky), net.model.clone())
        .build()
        .unwrap();

    let mut resets = 0;
    run(
        &mut state,
        |_| Ok(()),
        || {
            resets += 1;
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(resets, 1);
    // The failed model broadcast, then both model broadcasts of the retry.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(net.weight.to_vec(), vec![4.0]);
}

#[test]
fn removed_hosts_skip_the_sync() {
    let (flaky, calls) = Flaky::new(0);
    let step = Tracked::new(0_u32);
    let mut state = ObjectState::new(eager_context(flaky), vec![step.attribute("step")]).unwrap();

    let reset_hooks = Tracked::new(0_u32);
    let counter = reset_hooks.clone();
    state.register_reset_callbacks([Box::new(move || {
        *counter.write() += 1;
        Ok(())
    }) as elastic::state::ResetCallback]);

    let mut attempts = 0;
    run(
        &mut state,
        |_| {
            attempts += 1;
            if attempts == 1 {
                return Err(StateErr::HostsUpdated { skip_sync: true });
            }

            Ok(())
        },
        || Ok(()),
    )
    .unwrap();

    // Only the first attempt synced the attributes.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reset_hooks.get(), 1);
}

#[test]
fn added_hosts_sync_again() {
    let (flaky, calls) = Flaky::new(0);
    let step = Tracked::new(0_u32);
    let mut state = ObjectState::new(eager_context(flaky), vec![step.attribute("step")]).unwrap();

    let mut attempts = 0;
    run(
        &mut state,
        |_| {
            attempts += 1;
            if attempts == 1 {
                return Err(StateErr::HostsUpdated { skip_sync: false });
            }

            Ok(())
        },
        || Ok(()),
    )
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn reset_limit_is_enforced() {
    let mut state = ObjectState::new(solo(), Vec::new()).unwrap();
    let config = RunConfig::new().with_reset_limit(NonZeroUsize::new(2).unwrap());

    let mut resets = 0;
    let res: Result<()> = run_with(
        &config,
        &mut state,
        |_| Err(StateErr::HostsUpdated { skip_sync: false }),
        || {
            resets += 1;
            Ok(())
        },
    );

    assert!(matches!(res, Err(StateErr::ResetLimitExceeded(2))));
    assert_eq!(resets, 2);
}

#[test]
fn other_errors_are_not_retried() {
    let mut state = ObjectState::new(solo(), Vec::new()).unwrap();

    let res: Result<()> = run(
        &mut state,
        |_| Err(StateErr::MissingOptimizer),
        || panic!("no reset expected"),
    );

    assert!(matches!(res, Err(StateErr::MissingOptimizer)));
}

#[test]
fn reset_can_replace_the_collective() {
    let (flaky, _) = Flaky::new(0);
    let ctx = eager_context(flaky);
    let mut state = ObjectState::new(ctx.clone(), Vec::new()).unwrap();

    let mut attempts = 0;
    run(
        &mut state,
        |state| {
            attempts += 1;
            if attempts == 1 {
                return Err(StateErr::HostsUpdated { skip_sync: false });
            }

            assert_eq!(state.context().size(), 1);
            Ok(())
        },
        || {
            let fresh = LocalGroup::new(NonZeroUsize::MIN).remove(0);
            ctx.replace_collective(Arc::new(fresh));
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(attempts, 2);
}
