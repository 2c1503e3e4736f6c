//! Timer core scenarios on a manual clock: ordering, cancellation, error
//! recovery, unref migration, and bucket lifecycle.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Recorder, TestDomain, setup};
use tern_timers::{CallbackError, Timeout};

fn push(events: &Recorder, name: &'static str) -> Box<dyn FnMut() -> Result<(), CallbackError>> {
    let events = events.clone();
    Box::new(move || {
        events.push(name);
        Ok(())
    })
}

#[test]
fn same_bucket_fires_in_activation_order() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    sched.set_timeout(push(&events, "a"), 10.0);
    sched.set_timeout(push(&events, "b"), 10.0);
    sched.set_timeout(push(&events, "c"), 10.0);
    assert_eq!(sched.refed_bucket_count(), 1);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a", "b", "c"]);
    // The drained bucket is gone, along with its native handle.
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(driver.open_handle_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn buckets_of_different_durations_fire_independently() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    sched.set_timeout(push(&events, "a"), 5.0);
    sched.set_timeout(push(&events, "b"), 10.0);
    assert_eq!(sched.refed_bucket_count(), 2);

    clock.advance(5);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a"]);
    assert_eq!(sched.refed_bucket_count(), 1);

    clock.advance(5);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a", "b"]);
    assert_eq!(sched.refed_bucket_count(), 0);
}

#[test]
fn fire_order_per_duration_matches_activation_order() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    sched.set_timeout(push(&events, "a10"), 10.0);
    sched.set_timeout(push(&events, "b20"), 20.0);
    sched.set_timeout(push(&events, "c10"), 10.0);
    sched.set_timeout(push(&events, "d20"), 20.0);
    sched.set_timeout(push(&events, "e10"), 10.0);

    clock.advance(10);
    driver.run_due().unwrap();
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a10", "c10", "e10", "b20", "d20"]);
}

#[test]
fn five_tens_and_two_twenties_share_two_native_handles() {
    let (_clock, driver, sched) = setup();
    let events = Recorder::new();
    sched.set_timeout(push(&events, "t1"), 10.0);
    sched.set_timeout(push(&events, "u1"), 20.0);
    sched.set_timeout(push(&events, "t2"), 10.0);
    sched.set_timeout(push(&events, "t3"), 10.0);
    sched.set_timeout(push(&events, "u2"), 20.0);
    sched.set_timeout(push(&events, "t4"), 10.0);
    sched.set_timeout(push(&events, "t5"), 10.0);
    assert_eq!(driver.open_handle_count(), 2);
    assert_eq!(sched.refed_bucket_count(), 2);
}

#[test]
fn callback_cancelling_a_sibling_in_the_same_drain() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let victim: Rc<RefCell<Option<Timeout>>> = Rc::new(RefCell::new(None));
    {
        let sched = sched.clone();
        let victim = victim.clone();
        let events = events.clone();
        sched.clone().set_timeout(
            move || {
                events.push("a");
                if let Some(b) = victim.borrow_mut().take() {
                    sched.clear_timeout(&b);
                }
                Ok(())
            },
            10.0,
        );
    }
    let b = sched.set_timeout(push(&events, "b"), 10.0);
    *victim.borrow_mut() = Some(b);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a"]);
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn cleared_timer_never_fires() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "never"), 10.0);
    clock.advance(5);
    driver.run_due().unwrap();
    sched.clear_timeout(&timer);
    clock.advance(10);
    driver.run_due().unwrap();
    assert!(events.snapshot().is_empty());
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(driver.open_handle_count(), 0);
}

#[test]
fn clearing_twice_and_clearing_fired_timers_is_a_noop() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "x"), 10.0);
    sched.clear_timeout(&timer);
    sched.clear_timeout(&timer);

    let fired = sched.set_timeout(push(&events, "y"), 10.0);
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["y"]);
    sched.clear_timeout(&fired);
    sched.clear_interval(&fired);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn throwing_callback_defers_siblings_to_next_tick() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    sched.set_timeout(|| Err(CallbackError::msg("boom")), 10.0);
    sched.set_timeout(push(&events, "b"), 10.0);

    clock.advance(10);
    let err = driver.run_due().unwrap_err();
    assert!(err.to_string().contains("boom"));
    // The sibling did not run in the failing frame, but a resumption is
    // queued for the next tick.
    assert!(events.snapshot().is_empty());
    assert!(sched.has_pending_next_tick());

    sched.run_next_tick().unwrap();
    assert_eq!(events.snapshot(), ["b"]);
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn interval_rearms_from_fire_time_without_drift() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = {
        let events = events.clone();
        let driver = driver.clone();
        let clock = clock.clone();
        sched.set_interval(
            move || {
                events.push(format!("fire@{}", driver.now_ms()));
                // Simulate 10ms of callback work.
                clock.advance(10);
                Ok(())
            },
            50.0,
        )
    };

    clock.advance(50);
    driver.run_due().unwrap();
    clock.advance(40); // 60 -> 100
    driver.run_due().unwrap();
    clock.advance(40); // 110 -> 150
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["fire@50", "fire@100", "fire@150"]);

    sched.clear_interval(&timer);
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
    assert_eq!(driver.open_handle_count(), 0);
}

#[test]
fn interval_stops_when_cleared_from_its_own_callback() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let slot: Rc<RefCell<Option<Timeout>>> = Rc::new(RefCell::new(None));
    let timer = {
        let sched = sched.clone();
        let slot = slot.clone();
        let events = events.clone();
        let count = std::cell::Cell::new(0);
        sched.clone().set_interval(
            move || {
                events.push("tick");
                count.set(count.get() + 1);
                if count.get() == 3 {
                    if let Some(me) = slot.borrow_mut().take() {
                        sched.clear_interval(&me);
                    }
                }
                Ok(())
            },
            10.0,
        )
    };
    *slot.borrow_mut() = Some(timer);

    for _ in 0..5 {
        clock.advance(10);
        driver.run_due().unwrap();
    }
    assert_eq!(events.snapshot(), ["tick", "tick", "tick"]);
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn unref_migrates_to_a_private_handle_and_still_fires() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "fired"), 100.0);
    assert_eq!(driver.armed_refed_count(), 1);

    timer.unref();
    // The shared refed bucket is gone; a private unrefed handle carries the
    // remaining delay.
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(driver.open_handle_count(), 1);
    assert_eq!(driver.armed_refed_count(), 0);
    assert_eq!(driver.next_deadline(), Some(100));

    clock.advance(100);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["fired"]);
    assert_eq!(driver.open_handle_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn unref_then_ref_restores_liveness() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "fired"), 100.0);
    timer.unref();
    assert_eq!(driver.armed_refed_count(), 0);
    timer.ref_();
    assert_eq!(driver.armed_refed_count(), 1);

    clock.advance(100);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["fired"]);
}

#[test]
fn unref_reuses_the_bucket_handle_when_it_empties() {
    let (_clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "x"), 100.0);
    assert_eq!(driver.open_handle_count(), 1);
    timer.unref();
    // Sole occupant: the bucket's handle was stopped and repurposed rather
    // than closed and reallocated.
    assert_eq!(driver.open_handle_count(), 1);

    // With a sibling in the bucket, migration must allocate a second handle.
    let (_clock2, driver2, sched2) = setup();
    sched2.set_timeout(push(&events, "stays"), 100.0);
    let other = sched2.set_timeout(push(&events, "moves"), 100.0);
    other.unref();
    assert_eq!(driver2.open_handle_count(), 2);
    assert_eq!(sched2.refed_bucket_count(), 1);
}

#[test]
fn unref_on_a_fired_one_shot_reclaims_it_and_ref_is_a_noop() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_timeout(push(&events, "once"), 10.0);
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["once"]);

    timer.unref();
    timer.ref_();
    clock.advance(100);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["once"]);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn unrefed_interval_keeps_firing_on_its_private_handle() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let timer = sched.set_interval(push(&events, "tick"), 50.0);
    timer.unref();
    assert_eq!(driver.armed_refed_count(), 0);

    for _ in 0..3 {
        clock.advance(50);
        driver.run_due().unwrap();
    }
    assert_eq!(events.snapshot(), ["tick", "tick", "tick"]);
    assert_eq!(driver.armed_refed_count(), 0);

    sched.clear_interval(&timer);
    assert_eq!(driver.open_handle_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn enroll_unenroll_roundtrip_deactivates_until_reenrolled() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let item = sched.adopt(push(&events, "x"));

    sched.enroll(&item, 10.0).unwrap();
    sched.active(&item);
    sched.unenroll(&item);
    // Unenrolled: activation is a silent no-op until re-enrolled.
    sched.active(&item);
    clock.advance(20);
    driver.run_due().unwrap();
    assert!(events.snapshot().is_empty());
    assert_eq!(sched.refed_bucket_count(), 0);

    sched.enroll(&item, 10.0).unwrap();
    sched.active(&item);
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["x"]);

    // Enrolled items are reusable records: activate the same one again.
    sched.active(&item);
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["x", "x"]);

    item.release();
    assert_eq!(sched.live_timer_count(), 0);
}

#[test]
fn reactivation_moves_an_item_to_the_tail_of_its_bucket() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let first = sched.adopt(push(&events, "first"));
    let second = sched.adopt(push(&events, "second"));
    sched.enroll(&first, 10.0).unwrap();
    sched.enroll(&second, 10.0).unwrap();
    sched.active(&first);
    sched.active(&second);
    // Re-activating "first" restamps its start time and moves it behind
    // "second".
    clock.advance(5);
    driver.run_due().unwrap();
    sched.active(&first);

    clock.advance(5);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["second"]);
    clock.advance(5);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["second", "first"]);
    first.release();
    second.release();
}

#[test]
fn unref_active_goes_through_the_unrefed_registry() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let item = sched.adopt(push(&events, "quiet"));
    sched.enroll(&item, 10.0).unwrap();
    sched.unref_active(&item);
    assert_eq!(sched.unrefed_bucket_count(), 1);
    assert_eq!(sched.refed_bucket_count(), 0);
    assert_eq!(driver.armed_refed_count(), 0);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["quiet"]);
    // Unrefed buckets are collapsed by the dispatch loop itself.
    assert_eq!(sched.unrefed_bucket_count(), 0);
    item.release();
}

#[test]
fn disposed_domain_aborts_the_drain_until_a_new_activation_heals_it() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let domain = Rc::new(TestDomain::default());
    sched.set_domain(Some(domain.clone()));
    sched.set_timeout(push(&events, "a"), 10.0);
    sched.set_domain(None);
    sched.set_timeout(push(&events, "b"), 10.0);

    domain.disposed.set(true);
    clock.advance(10);
    driver.run_due().unwrap();
    // The drain stopped at the disposed item; the survivor stays queued and
    // the bucket is not re-armed.
    assert!(events.snapshot().is_empty());
    assert_eq!(sched.refed_bucket_count(), 1);
    clock.advance(50);
    driver.run_due().unwrap();
    assert!(events.snapshot().is_empty());

    // A fresh activation of the same duration re-arms the bucket for the
    // overdue survivor at once, not a full period out.
    sched.set_timeout(push(&events, "c"), 10.0);
    assert_eq!(driver.next_deadline(), Some(driver.now_ms()));
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["b"]);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["b", "c"]);
    assert_eq!(domain.entered.get(), 0);
}

#[test]
fn domain_swallowing_an_error_keeps_the_drain_on_the_same_tick() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let domain = Rc::new(TestDomain::default());
    domain.swallow.set(true);
    sched.set_domain(Some(domain.clone()));
    sched.set_timeout(|| Err(CallbackError::msg("swallowed")), 10.0);
    sched.set_domain(None);
    sched.set_timeout(push(&events, "b"), 10.0);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["b"]);
    assert!(!sched.has_pending_next_tick());
    assert_eq!(domain.entered.get(), 1);
    assert_eq!(domain.exited.get(), 1);
}

#[test]
fn domain_boundaries_wrap_each_callback() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    let domain = Rc::new(TestDomain::default());
    sched.set_domain(Some(domain.clone()));
    sched.set_timeout(push(&events, "a"), 10.0);
    sched.set_timeout(push(&events, "b"), 10.0);
    sched.set_domain(None);

    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["a", "b"]);
    assert_eq!(domain.entered.get(), 2);
    assert_eq!(domain.exited.get(), 2);
}

#[test]
fn callbacks_can_schedule_more_timers_of_the_same_duration() {
    let (clock, driver, sched) = setup();
    let events = Recorder::new();
    {
        let sched = sched.clone();
        let events = events.clone();
        sched.clone().set_timeout(
            move || {
                events.push("outer");
                let events = events.clone();
                sched.set_timeout(
                    move || {
                        events.push("inner");
                        Ok(())
                    },
                    10.0,
                );
                Ok(())
            },
            10.0,
        );
    }

    clock.advance(10);
    driver.run_due().unwrap();
    // The nested timer was activated mid-drain and must wait a full period.
    assert_eq!(events.snapshot(), ["outer"]);
    clock.advance(10);
    driver.run_due().unwrap();
    assert_eq!(events.snapshot(), ["outer", "inner"]);
    assert_eq!(sched.refed_bucket_count(), 0);
}
