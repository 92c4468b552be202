use std::thread;
use std::time::{Duration, Instant};

use asg::device::test_utils::TestHarness;
use asg::device::{
    AddressSpaceGraphicsContext, AsgCommand, AsgCreateInfo, HostState, PingInfo, RingContext,
    UnavailableRead, MAX_UNAVAILABLE_READS,
};
use pretty_assertions::assert_eq;

fn wait_for_state(ring: &RingContext, state: HostState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ring.host_state() != Some(state) {
        assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
        thread::yield_now();
    }
}

fn notify(ctx: &mut AddressSpaceGraphicsContext) {
    let mut info = PingInfo::command(AsgCommand::NotifyAvailable.as_raw());
    ctx.perform(&mut info).unwrap();
}

fn threaded_context(harness: &TestHarness) -> AddressSpaceGraphicsContext {
    AddressSpaceGraphicsContext::new(
        harness.globals.clone(),
        AsgCreateInfo {
            create_render_thread: true,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn consumer_polls_until_the_threshold() {
    let harness = TestHarness::new();
    let mut ctx =
        AddressSpaceGraphicsContext::new(harness.globals.clone(), AsgCreateInfo::default())
            .unwrap();
    notify(&mut ctx);

    for expected in 1..MAX_UNAVAILABLE_READS {
        assert_eq!(ctx.on_unavailable_read(), UnavailableRead::KeepPolling);
        assert_eq!(ctx.unavailable_read_count(), expected);
        assert_eq!(ctx.ring().host_state(), Some(HostState::CanConsume));
    }
    assert_eq!(ctx.on_unavailable_read(), UnavailableRead::Retry);
    assert_eq!(ctx.unavailable_read_count(), 0);
    assert_eq!(ctx.ring().host_state(), Some(HostState::CanConsume));
}

#[test]
fn sleeping_consumer_is_woken_by_notify() {
    let harness = TestHarness::threaded();
    let mut ctx = threaded_context(&harness);
    let handle = ctx.consumer().unwrap();

    wait_for_state(ctx.ring(), HostState::NeedNotify);
    notify(&mut ctx);
    // The consumer finds nothing to read and goes back to sleep.
    wait_for_state(ctx.ring(), HostState::NeedNotify);

    drop(ctx);
    assert_eq!(
        harness.consumer.outcomes(handle).unwrap(),
        vec![UnavailableRead::Retry, UnavailableRead::Exit]
    );
}

#[test]
fn teardown_releases_a_blocked_consumer() {
    let harness = TestHarness::threaded();
    let ctx = threaded_context(&harness);
    let handle = ctx.consumer().unwrap();
    let ring = ctx.ring().clone();

    wait_for_state(&ring, HostState::NeedNotify);
    drop(ctx);

    assert_eq!(ring.host_state(), Some(HostState::Exit));
    assert_eq!(
        harness.consumer.outcomes(handle).unwrap(),
        vec![UnavailableRead::Exit]
    );
}

#[test]
fn snapshot_pauses_and_resumes_the_consumer() {
    let harness = TestHarness::threaded();
    let ctx = threaded_context(&harness);
    let handle = ctx.consumer().unwrap();

    harness.globals.pre_save();
    ctx.pre_save();
    let mut bytes = Vec::new();
    harness.globals.save(&mut bytes).unwrap();
    ctx.save(&mut bytes).unwrap();
    ctx.post_save();
    harness.globals.post_save();

    drop(ctx);
    assert_eq!(
        harness.consumer.outcomes(handle).unwrap(),
        vec![
            UnavailableRead::Paused,
            UnavailableRead::Resumed,
            UnavailableRead::Exit
        ]
    );
}

#[test]
fn notifications_coalesce_while_consumer_sleeps() {
    let harness = TestHarness::threaded();
    let mut ctx = threaded_context(&harness);
    let handle = ctx.consumer().unwrap();

    wait_for_state(ctx.ring(), HostState::NeedNotify);
    for _ in 0..16 {
        notify(&mut ctx);
    }
    drop(ctx);

    let outcomes = harness.consumer.outcomes(handle).unwrap();
    assert_eq!(outcomes.last(), Some(&UnavailableRead::Exit));
    let retries = outcomes
        .iter()
        .filter(|outcome| **outcome == UnavailableRead::Retry)
        .count();
    assert!((1..=16).contains(&retries), "{outcomes:?}");
}
