//! A linear chain of asynchronous steps, per spec §4.6. No executor
//! dependency: each step is driven forward explicitly by calling the `next`
//! closure handed to it, matching the single-threaded cooperative model in
//! spec §5 and `mujmap`'s own preference for synchronous control flow.

type Step<T> = Box<dyn FnMut(&mut dyn FnMut(T), T)>;
type Lastly<T> = Box<dyn FnMut(usize, usize)>;

/// `Sequence<T>` chains steps that each receive the running value and a
/// `next` callback to advance to the following step. Calling `go` starts
/// the chain; a step that never calls `next` simply suspends the sequence
/// (e.g. waiting on an HTTP round-trip) until something else resumes it.
pub struct Sequence<T> {
    steps: Vec<Step<T>>,
    lastly: Option<Lastly<T>>,
    index: usize,
    length: usize,
}

impl<T: 'static> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Sequence<T> {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            lastly: None,
            index: 0,
            length: 0,
        }
    }

    /// Append a step. `fn(next, data)` must call `next(value)` to advance the
    /// sequence to the following step with `value`.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnMut(&mut dyn FnMut(T), T) + 'static,
    {
        self.steps.push(Box::new(step));
        self.length = self.steps.len();
        self
    }

    /// Set the terminal hook, called with `(index, length)` once the chain
    /// completes normally or is cancelled.
    pub fn lastly<F>(mut self, hook: F) -> Self
    where
        F: FnMut(usize, usize) + 'static,
    {
        self.lastly = Some(Box::new(hook));
        self
    }

    /// `round(100 * index / length)`, or `100` for an empty sequence.
    pub fn progress(&self) -> u32 {
        if self.length == 0 {
            100
        } else {
            ((100 * self.index) as f64 / self.length as f64).round() as u32
        }
    }

    /// Truncate the remaining length to zero and fire the terminal hook.
    /// Further calls to `go` on this sequence are no-ops.
    pub fn cancel(&mut self) {
        self.length = self.index;
        self.steps.truncate(self.index);
        if let Some(lastly) = self.lastly.as_mut() {
            lastly(self.index, self.length);
        }
    }

    /// Begin (or resume) the chain by invoking step `index` with `data`.
    /// Recurses through steps synchronously as long as each one calls
    /// `next` before returning; a step that suspends (e.g. to wait on I/O)
    /// simply returns without calling `next`, and some other code path is
    /// responsible for re-entering via a fresh `go` call capturing the
    /// continuation.
    pub fn go(mut self, data: T) -> Self {
        self.run(data);
        self
    }

    fn run(&mut self, data: T) {
        if self.index >= self.steps.len() {
            if let Some(lastly) = self.lastly.as_mut() {
                lastly(self.index, self.length);
            }
            return;
        }
        let step_index = self.index;
        self.index += 1;

        // SAFETY-free approach: steps are stored behind Box<dyn FnMut>, so we
        // must avoid re-borrowing `self` mutably while the step itself also
        // wants `self`. We take the step out temporarily.
        let mut step = std::mem::replace(&mut self.steps[step_index], Box::new(|_, _| {}));

        let mut advanced = None;
        {
            let mut next = |value: T| {
                advanced = Some(value);
            };
            step(&mut next, data);
        }
        self.steps[step_index] = step;

        if let Some(value) = advanced {
            self.run(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn runs_steps_in_order_and_fires_lastly() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log1 = log.clone();
        let log2 = log.clone();
        let log3 = log.clone();

        let seq = Sequence::new()
            .then(move |next, data: i32| {
                log1.borrow_mut().push(("step1", data));
                next(data + 1);
            })
            .then(move |next, data: i32| {
                log2.borrow_mut().push(("step2", data));
                next(data + 1);
            })
            .lastly(move |index, length| {
                log3.borrow_mut().push(("lastly", (index * 100 + length) as i32));
            });

        let seq = seq.go(0);
        assert_eq!(seq.progress(), 100);
        assert_eq!(
            *log.borrow(),
            vec![("step1", 0), ("step2", 1), ("lastly", 202)]
        );
    }

    #[test]
    fn suspended_step_does_not_advance() {
        let seq = Sequence::<i32>::new()
            .then(|_next, _data| { /* never calls next: suspends */ })
            .then(|next, data| next(data));
        let seq = seq.go(0);
        assert_eq!(seq.progress(), 50);
    }

    #[test]
    fn cancel_truncates_and_fires_lastly() {
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        let mut seq = Sequence::<i32>::new()
            .then(|_next, _data| {})
            .then(|_next, _data| {})
            .then(|_next, _data| {})
            .lastly(move |index, length| {
                *fired2.borrow_mut() = Some((index, length));
            });
        seq.cancel();
        assert_eq!(*fired.borrow(), Some((0, 0)));
    }
}
