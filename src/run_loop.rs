//! A minimal phase scheduler. Nothing here owns a `Connection` or a
//! `Store`; it is deliberately small enough to drive `Connection::flush`
//! from test code and observe callback ordering without standing up a real
//! event loop — the run loop itself belongs to the host application.

use std::collections::VecDeque;

/// Where a queued action runs relative to one `tick()`.
///
/// `Before` actions run first (e.g. "flush pending local edits to the
/// queues"), `Middle` next (the network round trip itself), `After` last
/// (anything that should only see post-dispatch store state). Within a
/// phase, actions run in the order they were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Before,
    Middle,
    After,
}

/// A scheduler a `Connection` (or anything else with phased work) can be
/// driven through. Parameterized over the lifetime of the closures it can
/// hold, so an implementation backed by a fixed-lifetime queue (like
/// `SynchronousRunLoop<'a>`) can implement it without narrowing the method
/// signature below what the trait promises.
pub trait RunLoop<'a> {
    /// Schedule `action` to run during `phase` on the next `tick()`.
    fn schedule(&mut self, phase: Phase, action: Box<dyn FnOnce() + 'a>);

    /// Drain every scheduled action once, in `Before`, `Middle`, `After`
    /// order. Actions scheduled by an action that is already running are
    /// not visited by the same `tick()` — they wait for the next one.
    fn tick(&mut self);
}

/// A three-queue FIFO scheduler: one `VecDeque` per `Phase`, drained in
/// `Before` → `Middle` → `After` order on each `tick()`.
#[derive(Default)]
pub struct SynchronousRunLoop<'a> {
    before: VecDeque<Box<dyn FnOnce() + 'a>>,
    middle: VecDeque<Box<dyn FnOnce() + 'a>>,
    after: VecDeque<Box<dyn FnOnce() + 'a>>,
}

impl<'a> SynchronousRunLoop<'a> {
    pub fn new() -> Self {
        Self {
            before: VecDeque::new(),
            middle: VecDeque::new(),
            after: VecDeque::new(),
        }
    }

    fn queue_for(&mut self, phase: Phase) -> &mut VecDeque<Box<dyn FnOnce() + 'a>> {
        match phase {
            Phase::Before => &mut self.before,
            Phase::Middle => &mut self.middle,
            Phase::After => &mut self.after,
        }
    }
}

impl<'a> RunLoop<'a> for SynchronousRunLoop<'a> {
    fn schedule(&mut self, phase: Phase, action: Box<dyn FnOnce() + 'a>) {
        self.queue_for(phase).push_back(action);
    }

    fn tick(&mut self) {
        for queue in [&mut self.before, &mut self.middle, &mut self.after] {
            while let Some(action) = queue.pop_front() {
                action();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn phases_run_in_before_middle_after_order() {
        let log = RefCell::new(Vec::new());
        let mut run_loop = SynchronousRunLoop::new();
        run_loop.schedule(Phase::After, Box::new(|| log.borrow_mut().push("after")));
        run_loop.schedule(Phase::Before, Box::new(|| log.borrow_mut().push("before")));
        run_loop.schedule(Phase::Middle, Box::new(|| log.borrow_mut().push("middle")));
        run_loop.tick();
        assert_eq!(*log.borrow(), vec!["before", "middle", "after"]);
    }

    #[test]
    fn same_phase_actions_run_in_scheduled_order() {
        let log = RefCell::new(Vec::new());
        let mut run_loop = SynchronousRunLoop::new();
        run_loop.schedule(Phase::Middle, Box::new(|| log.borrow_mut().push(1)));
        run_loop.schedule(Phase::Middle, Box::new(|| log.borrow_mut().push(2)));
        run_loop.schedule(Phase::Middle, Box::new(|| log.borrow_mut().push(3)));
        run_loop.tick();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn actions_scheduled_during_a_tick_wait_for_the_next_one() {
        let log = RefCell::new(Vec::new());
        let mut run_loop = SynchronousRunLoop::new();
        let logged_during_first_tick = RefCell::new(false);
        run_loop.schedule(
            Phase::Before,
            Box::new(|| {
                log.borrow_mut().push("before");
                *logged_during_first_tick.borrow_mut() = true;
            }),
        );
        run_loop.tick();
        assert_eq!(*log.borrow(), vec!["before"]);

        run_loop.schedule(Phase::After, Box::new(|| log.borrow_mut().push("after")));
        run_loop.tick();
        assert_eq!(*log.borrow(), vec!["before", "after"]);
    }
}
