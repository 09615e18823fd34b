//! Composable scheduling strategies.
//!
//! A [`Schedule`] is a factory: given `{clock, random}` dependencies it
//! yields an independent stateful step function `&Input -> Next<Output>`,
//! where every continuation carries the delay to wait before the next step.
//! Factories compose; steps are single-threaded state machines and must not
//! be shared across tasks.
//!
//! Retry, repeat, and rate-limit behaviors are all spelled as schedule
//! expressions, e.g. `exponential(100).take(2).max_delay(20_000).jitter(1.0)`.

use std::sync::Arc;

use evolu_engine::{Clock, Millis, RandomSource, SystemClock, SystemRandom};

/// Clock and randomness a schedule draws from.
#[derive(Clone)]
pub struct ScheduleDeps {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

impl Default for ScheduleDeps {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(SystemRandom),
        }
    }
}

/// One step's verdict: continue with an output after a delay, or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next<O> {
    Continue { output: O, delay: Millis },
    Done,
}

impl<O> Next<O> {
    fn map<P>(self, f: impl FnOnce(O) -> P) -> Next<P> {
        match self {
            Next::Continue { output, delay } => Next::Continue {
                output: f(output),
                delay,
            },
            Next::Done => Next::Done,
        }
    }
}

/// A live step function produced by a schedule factory.
pub type Step<I, O> = Box<dyn FnMut(&I) -> Next<O> + Send>;

/// A composable scheduling strategy.
///
/// Cloning is cheap; every [`Schedule::step`] call produces an independent
/// state machine.
pub struct Schedule<I, O> {
    make: Arc<dyn Fn(&ScheduleDeps) -> Step<I, O> + Send + Sync>,
}

impl<I, O> Clone for Schedule<I, O> {
    fn clone(&self) -> Self {
        Self {
            make: self.make.clone(),
        }
    }
}

impl<I: 'static, O: 'static> Schedule<I, O> {
    /// Wrap a factory.
    pub fn new(make: impl Fn(&ScheduleDeps) -> Step<I, O> + Send + Sync + 'static) -> Self {
        Self {
            make: Arc::new(make),
        }
    }

    /// Produce a fresh step.
    pub fn step(&self, deps: &ScheduleDeps) -> Step<I, O> {
        (self.make)(deps)
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Step forever with zero delay, outputting the repetition count.
pub fn forever<I: 'static>() -> Schedule<I, u64> {
    unfold_counter(|_| 0)
}

/// Exactly one step.
pub fn once<I: 'static>() -> Schedule<I, u64> {
    recurs(1)
}

/// `times` steps, outputting `0..times`.
pub fn recurs<I: 'static>(times: u64) -> Schedule<I, u64> {
    Schedule::new(move |_| {
        let mut n = 0u64;
        Box::new(move |_| {
            if n >= times {
                return Next::Done;
            }
            let output = n;
            n += 1;
            Next::Continue { output, delay: 0 }
        })
    })
}

/// Step forever with a constant delay.
pub fn spaced<I: 'static>(delay: Millis) -> Schedule<I, u64> {
    unfold_counter(move |_| delay)
}

/// Exponential backoff: `base * 2^n`.
pub fn exponential<I: 'static>(base: Millis) -> Schedule<I, u64> {
    exponential_with_factor(base, 2.0)
}

/// Exponential backoff with an explicit growth factor.
pub fn exponential_with_factor<I: 'static>(base: Millis, factor: f64) -> Schedule<I, u64> {
    unfold_counter(move |n| (base as f64 * factor.powi(n as i32)).round() as Millis)
}

/// Linear backoff: `base * (n + 1)`.
pub fn linear<I: 'static>(base: Millis) -> Schedule<I, u64> {
    unfold_counter(move |n| base * (n + 1))
}

/// Fibonacci backoff: `one, one, 2*one, 3*one, …`.
pub fn fibonacci<I: 'static>(one: Millis) -> Schedule<I, u64> {
    Schedule::new(move |_| {
        let mut n = 0u64;
        let mut pair = (one, one);
        Box::new(move |_| {
            let output = n;
            n += 1;
            let delay = pair.0;
            pair = (pair.1, pair.0 + pair.1);
            Next::Continue { output, delay }
        })
    })
}

/// Recur on fixed window boundaries measured from the first step; when
/// execution has overrun the current window the delay is skipped entirely.
pub fn fixed<I: 'static>(interval: Millis) -> Schedule<I, u64> {
    window_schedule(interval, true)
}

/// Recur on window boundaries, always waiting for the next boundary.
pub fn windowed<I: 'static>(interval: Millis) -> Schedule<I, u64> {
    window_schedule(interval, false)
}

fn window_schedule<I: 'static>(interval: Millis, skip_when_behind: bool) -> Schedule<I, u64> {
    Schedule::new(move |deps| {
        let clock = deps.clock.clone();
        let mut start: Option<Millis> = None;
        let mut n = 0u64;
        Box::new(move |_| {
            let now = clock.now_millis();
            let start = *start.get_or_insert(now);
            let elapsed = now - start;

            let output = n;
            n += 1;

            let delay = if interval == 0 {
                0
            } else if skip_when_behind && elapsed >= n * interval {
                0
            } else {
                interval - (elapsed % interval)
            };
            Next::Continue { output, delay }
        })
    })
}

/// One step with the given delay.
pub fn from_delay<I: 'static>(delay: Millis) -> Schedule<I, u64> {
    from_delays(vec![delay])
}

/// One step per delay in the list, in order.
pub fn from_delays<I: 'static>(delays: Vec<Millis>) -> Schedule<I, u64> {
    Schedule::new(move |_| {
        let delays = delays.clone();
        let mut n = 0usize;
        Box::new(move |_| {
            let Some(&delay) = delays.get(n) else {
                return Next::Done;
            };
            let output = n as u64;
            n += 1;
            Next::Continue { output, delay }
        })
    })
}

/// Step forever, outputting milliseconds since the first step.
pub fn elapsed<I: 'static>() -> Schedule<I, Millis> {
    Schedule::new(move |deps| {
        let clock = deps.clock.clone();
        let mut start: Option<Millis> = None;
        Box::new(move |_| {
            let now = clock.now_millis();
            let start = *start.get_or_insert(now);
            Next::Continue {
                output: now - start,
                delay: 0,
            }
        })
    })
}

/// Step while less than `duration` has elapsed, outputting the elapsed time.
pub fn during<I: 'static>(duration: Millis) -> Schedule<I, Millis> {
    Schedule::new(move |deps| {
        let clock = deps.clock.clone();
        let mut start: Option<Millis> = None;
        Box::new(move |_| {
            let now = clock.now_millis();
            let start = *start.get_or_insert(now);
            let elapsed = now - start;
            if elapsed >= duration {
                return Next::Done;
            }
            Next::Continue {
                output: elapsed,
                delay: 0,
            }
        })
    })
}

/// Step forever, outputting a constant.
pub fn succeed<I: 'static, O: Clone + Send + Sync + 'static>(value: O) -> Schedule<I, O> {
    Schedule::new(move |_| {
        let value = value.clone();
        Box::new(move |_| Next::Continue {
            output: value.clone(),
            delay: 0,
        })
    })
}

/// Step forever, outputting successive states of `next`.
pub fn unfold<I: 'static, O: Clone + Send + Sync + 'static>(
    initial: O,
    next: impl Fn(&O) -> O + Send + Sync + 'static,
) -> Schedule<I, O> {
    let next = Arc::new(next);
    Schedule::new(move |_| {
        let next = next.clone();
        let mut state = initial.clone();
        Box::new(move |_| {
            let output = state.clone();
            state = next(&state);
            Next::Continue { output, delay: 0 }
        })
    })
}

/// Forever-with-counter helper: delay computed from the repetition index.
fn unfold_counter<I: 'static>(
    delay_for: impl Fn(u64) -> Millis + Send + Sync + 'static,
) -> Schedule<I, u64> {
    let delay_for = Arc::new(delay_for);
    Schedule::new(move |_| {
        let delay_for = delay_for.clone();
        let mut n = 0u64;
        Box::new(move |_| {
            let output = n;
            let delay = delay_for(n);
            n += 1;
            Next::Continue { output, delay }
        })
    })
}

// ---------------------------------------------------------------------------
// Limits, delay transforms, filters
// ---------------------------------------------------------------------------

impl<I: 'static, O: 'static> Schedule<I, O> {
    /// Stop after `n` outputs.
    pub fn take(self, n: u64) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let mut inner = self.step(deps);
            let mut emitted = 0u64;
            Box::new(move |input| {
                if emitted >= n {
                    return Next::Done;
                }
                let next = inner(input);
                if matches!(next, Next::Continue { .. }) {
                    emitted += 1;
                }
                next
            })
        })
    }

    /// Stop once more than `duration` has elapsed since the first step.
    pub fn max_elapsed(self, duration: Millis) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let clock = deps.clock.clone();
            let mut inner = self.step(deps);
            let mut start: Option<Millis> = None;
            Box::new(move |input| {
                let now = clock.now_millis();
                let start = *start.get_or_insert(now);
                if now - start > duration {
                    return Next::Done;
                }
                inner(input)
            })
        })
    }

    /// Clamp every delay to at most `cap`.
    pub fn max_delay(self, cap: Millis) -> Schedule<I, O> {
        self.modify_delay(move |delay| delay.min(cap))
    }

    /// Randomize delays: `delay * (1 - factor + 2 * factor * U(0, 1))`.
    pub fn jitter(self, factor: f64) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let random = deps.random.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| match inner(input) {
                Next::Continue { output, delay } => {
                    let scale = 1.0 - factor + 2.0 * factor * random.next_f64();
                    let jittered = (delay as f64 * scale).max(0.0).round() as Millis;
                    Next::Continue {
                        output,
                        delay: jittered,
                    }
                }
                Next::Done => Next::Done,
            })
        })
    }

    /// Add `initial` to the first delay only.
    pub fn delayed(self, initial: Millis) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let mut inner = self.step(deps);
            let mut first = true;
            Box::new(move |input| match inner(input) {
                Next::Continue { output, delay } => {
                    let extra = if first { initial } else { 0 };
                    first = false;
                    Next::Continue {
                        output,
                        delay: delay + extra,
                    }
                }
                Next::Done => Next::Done,
            })
        })
    }

    /// Add `extra` to every delay.
    pub fn add_delay(self, extra: Millis) -> Schedule<I, O> {
        self.modify_delay(move |delay| delay + extra)
    }

    /// Transform every delay.
    pub fn modify_delay(self, f: impl Fn(Millis) -> Millis + Send + Sync + 'static) -> Schedule<I, O> {
        let f = Arc::new(f);
        Schedule::new(move |deps| {
            let f = f.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| match inner(input) {
                Next::Continue { output, delay } => Next::Continue {
                    output,
                    delay: f(delay),
                },
                Next::Done => Next::Done,
            })
        })
    }

    /// Subtract the time spent executing between steps from the next delay.
    pub fn compensate_execution(self) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let clock = deps.clock.clone();
            let mut inner = self.step(deps);
            let mut previous: Option<(Millis, Millis)> = None;
            Box::new(move |input| {
                let now = clock.now_millis();
                match inner(input) {
                    Next::Continue { output, delay } => {
                        let execution = match previous {
                            Some((at, slept)) => (now - at).saturating_sub(slept),
                            None => 0,
                        };
                        let adjusted = delay.saturating_sub(execution);
                        previous = Some((now, adjusted));
                        Next::Continue {
                            output,
                            delay: adjusted,
                        }
                    }
                    Next::Done => Next::Done,
                }
            })
        })
    }

    /// Continue while the input satisfies the predicate.
    pub fn while_input(self, pred: impl Fn(&I) -> bool + Send + Sync + 'static) -> Schedule<I, O> {
        let pred = Arc::new(pred);
        self.until_input(move |input| !pred(input))
    }

    /// Stop as soon as the input satisfies the predicate.
    pub fn until_input(self, pred: impl Fn(&I) -> bool + Send + Sync + 'static) -> Schedule<I, O> {
        let pred = Arc::new(pred);
        Schedule::new(move |deps| {
            let pred = pred.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| {
                if pred(input) {
                    return Next::Done;
                }
                inner(input)
            })
        })
    }

    /// Continue while outputs satisfy the predicate.
    pub fn while_output(self, pred: impl Fn(&O) -> bool + Send + Sync + 'static) -> Schedule<I, O> {
        let pred = Arc::new(pred);
        self.until_output(move |output| !pred(output))
    }

    /// Stop as soon as an output satisfies the predicate.
    pub fn until_output(self, pred: impl Fn(&O) -> bool + Send + Sync + 'static) -> Schedule<I, O> {
        let pred = Arc::new(pred);
        Schedule::new(move |deps| {
            let pred = pred.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| match inner(input) {
                Next::Continue { output, delay } => {
                    if pred(&output) {
                        Next::Done
                    } else {
                        Next::Continue { output, delay }
                    }
                }
                Next::Done => Next::Done,
            })
        })
    }

    /// Route matching inputs to `alternative`, everything else to `self`.
    /// Both sides keep their own state.
    pub fn when_input(
        self,
        pred: impl Fn(&I) -> bool + Send + Sync + 'static,
        alternative: Schedule<I, O>,
    ) -> Schedule<I, O> {
        let pred = Arc::new(pred);
        Schedule::new(move |deps| {
            let pred = pred.clone();
            let mut primary = self.step(deps);
            let mut alt = alternative.step(deps);
            Box::new(move |input| {
                if pred(input) {
                    alt(input)
                } else {
                    primary(input)
                }
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Output transforms and collectors
// ---------------------------------------------------------------------------

impl<I: 'static, O: 'static> Schedule<I, O> {
    /// Map every output.
    pub fn map<P: 'static>(
        self,
        f: impl Fn(O) -> P + Send + Sync + 'static,
    ) -> Schedule<I, P> {
        let f = Arc::new(f);
        Schedule::new(move |deps| {
            let f = f.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| inner(input).map(|output| f(output)))
        })
    }

    /// Fold outputs into an accumulator and output the accumulator.
    pub fn fold<B: Clone + Send + Sync + 'static>(
        self,
        initial: B,
        f: impl Fn(&B, &O) -> B + Send + Sync + 'static,
    ) -> Schedule<I, B> {
        let f = Arc::new(f);
        Schedule::new(move |deps| {
            let f = f.clone();
            let mut inner = self.step(deps);
            let mut acc = initial.clone();
            Box::new(move |input| match inner(input) {
                Next::Continue { output, delay } => {
                    acc = f(&acc, &output);
                    Next::Continue {
                        output: acc.clone(),
                        delay,
                    }
                }
                Next::Done => Next::Done,
            })
        })
    }

    /// Output the repetition count instead of the inner output.
    pub fn repetitions(self) -> Schedule<I, u64> {
        self.fold(0u64, |count, _| count + 1).map(|count| count - 1)
    }

    /// Output every step's delay.
    pub fn delays(self) -> Schedule<I, Millis> {
        Schedule::new(move |deps| {
            let mut inner = self.step(deps);
            Box::new(move |input| match inner(input) {
                Next::Continue { delay, .. } => Next::Continue {
                    output: delay,
                    delay,
                },
                Next::Done => Next::Done,
            })
        })
    }

    /// Collect every output seen so far.
    pub fn collect_all_outputs(self) -> Schedule<I, Vec<O>>
    where
        O: Clone + Send + Sync,
    {
        self.fold(Vec::new(), |acc, output| {
            let mut next = acc.clone();
            next.push(output.clone());
            next
        })
    }

    /// Collect outputs while they satisfy the predicate.
    pub fn collect_while(
        self,
        pred: impl Fn(&O) -> bool + Send + Sync + 'static,
    ) -> Schedule<I, Vec<O>>
    where
        O: Clone + Send + Sync,
    {
        self.while_output(pred).collect_all_outputs()
    }

    /// Collect outputs until one satisfies the predicate.
    pub fn collect_until(
        self,
        pred: impl Fn(&O) -> bool + Send + Sync + 'static,
    ) -> Schedule<I, Vec<O>>
    where
        O: Clone + Send + Sync,
    {
        self.until_output(pred).collect_all_outputs()
    }

    /// Observe every output.
    pub fn tap_output(self, f: impl Fn(&O) + Send + Sync + 'static) -> Schedule<I, O> {
        let f = Arc::new(f);
        Schedule::new(move |deps| {
            let f = f.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| {
                let next = inner(input);
                if let Next::Continue { output, .. } = &next {
                    f(output);
                }
                next
            })
        })
    }

    /// Observe every input.
    pub fn tap_input(self, f: impl Fn(&I) + Send + Sync + 'static) -> Schedule<I, O> {
        let f = Arc::new(f);
        Schedule::new(move |deps| {
            let f = f.clone();
            let mut inner = self.step(deps);
            Box::new(move |input| {
                f(input);
                inner(input)
            })
        })
    }

    /// Output the input itself, keeping the inner cadence.
    pub fn passthrough(self) -> Schedule<I, I>
    where
        I: Clone,
    {
        Schedule::new(move |deps| {
            let mut inner = self.step(deps);
            Box::new(move |input| inner(input).map(|_| input.clone()))
        })
    }

    /// Collect inputs, keeping the inner cadence.
    pub fn collect_inputs(self) -> Schedule<I, Vec<I>>
    where
        I: Clone + Send + Sync,
    {
        self.passthrough().collect_all_outputs()
    }

    /// Reset the inner state after `duration` of inactivity between steps.
    pub fn reset_after(self, duration: Millis) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let clock = deps.clock.clone();
            let deps = deps.clone();
            let schedule = self.clone();
            let mut inner = schedule.step(&deps);
            let mut last: Option<Millis> = None;
            Box::new(move |input| {
                let now = clock.now_millis();
                if let Some(last) = last {
                    if now - last > duration {
                        inner = schedule.step(&deps);
                    }
                }
                last = Some(now);
                inner(input)
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

impl<I: 'static, O: 'static> Schedule<I, O> {
    /// Run `self` to completion, then `next`.
    pub fn sequence(self, next: Schedule<I, O>) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let mut first = self.step(deps);
            let mut second = next.step(deps);
            let mut on_first = true;
            Box::new(move |input| {
                if on_first {
                    match first(input) {
                        Next::Done => on_first = false,
                        next => return next,
                    }
                }
                second(input)
            })
        })
    }

    /// Continue while both continue; the delay is the longer one.
    pub fn intersect<O2: 'static>(self, other: Schedule<I, O2>) -> Schedule<I, (O, O2)> {
        Schedule::new(move |deps| {
            let mut left = self.step(deps);
            let mut right = other.step(deps);
            Box::new(move |input| match (left(input), right(input)) {
                (
                    Next::Continue {
                        output: a,
                        delay: da,
                    },
                    Next::Continue {
                        output: b,
                        delay: db,
                    },
                ) => Next::Continue {
                    output: (a, b),
                    delay: da.max(db),
                },
                _ => Next::Done,
            })
        })
    }

    /// Continue while either continues; the delay is the shorter one and the
    /// output comes from the sooner side.
    pub fn union(self, other: Schedule<I, O>) -> Schedule<I, O> {
        Schedule::new(move |deps| {
            let mut left = Some(self.step(deps));
            let mut right = Some(other.step(deps));
            Box::new(move |input| {
                let a = left.as_mut().map(|step| step(input)).unwrap_or(Next::Done);
                let b = right.as_mut().map(|step| step(input)).unwrap_or(Next::Done);
                if matches!(a, Next::Done) {
                    left = None;
                }
                if matches!(b, Next::Done) {
                    right = None;
                }
                match (a, b) {
                    (
                        Next::Continue {
                            output: oa,
                            delay: da,
                        },
                        Next::Continue {
                            output: ob,
                            delay: db,
                        },
                    ) => {
                        if da <= db {
                            Next::Continue {
                                output: oa,
                                delay: da,
                            }
                        } else {
                            Next::Continue {
                                output: ob,
                                delay: db,
                            }
                        }
                    }
                    (next @ Next::Continue { .. }, Next::Done) => next,
                    (Next::Done, next @ Next::Continue { .. }) => next,
                    (Next::Done, Next::Done) => Next::Done,
                }
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// The AWS-style default retry strategy: full jitter over capped exponential
/// backoff, three attempts total.
pub fn retry_strategy_aws<I: 'static>() -> Schedule<I, u64> {
    exponential(100).take(2).max_delay(20_000).jitter(1.0)
}

/// The AWS-style strategy for throttled calls: same shape, slower base.
pub fn retry_strategy_aws_throttled<I: 'static>() -> Schedule<I, u64> {
    exponential(1_000).take(2).max_delay(20_000).jitter(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_engine::{ManualClock, SeededRandom};

    fn test_deps(clock: Arc<ManualClock>) -> ScheduleDeps {
        ScheduleDeps {
            clock,
            random: Arc::new(SeededRandom::new(42)),
        }
    }

    fn static_deps() -> ScheduleDeps {
        test_deps(Arc::new(ManualClock::new(0)))
    }

    /// Drive a schedule with unit inputs, returning (output, delay) pairs.
    fn run<O: Clone + 'static>(schedule: &Schedule<(), O>, deps: &ScheduleDeps, max: usize) -> Vec<(O, Millis)> {
        let mut step = schedule.step(deps);
        let mut out = Vec::new();
        while out.len() < max {
            match step(&()) {
                Next::Continue { output, delay } => out.push((output, delay)),
                Next::Done => break,
            }
        }
        out
    }

    fn delays_of<O: Clone + 'static>(schedule: &Schedule<(), O>, deps: &ScheduleDeps, max: usize) -> Vec<Millis> {
        run(schedule, deps, max).into_iter().map(|(_, d)| d).collect()
    }

    #[test]
    fn recurs_counts_then_stops() {
        let deps = static_deps();
        let outputs: Vec<u64> = run(&recurs(3), &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 1, 2]);
        assert!(run(&recurs::<()>(0), &deps, 10).is_empty());
    }

    #[test]
    fn once_is_a_single_step() {
        let deps = static_deps();
        assert_eq!(run(&once(), &deps, 10).len(), 1);
    }

    #[test]
    fn exponential_take_three_yields_100_200_400() {
        let deps = static_deps();
        let schedule = exponential::<()>(100).take(3);
        assert_eq!(delays_of(&schedule, &deps, 10), vec![100, 200, 400]);
    }

    #[test]
    fn linear_and_spaced_and_fibonacci_delays() {
        let deps = static_deps();
        assert_eq!(delays_of(&linear::<()>(100), &deps, 3), vec![100, 200, 300]);
        assert_eq!(delays_of(&spaced::<()>(50), &deps, 3), vec![50, 50, 50]);
        assert_eq!(
            delays_of(&fibonacci::<()>(10), &deps, 6),
            vec![10, 10, 20, 30, 50, 80]
        );
    }

    #[test]
    fn from_delays_walks_the_list() {
        let deps = static_deps();
        let schedule = from_delays::<()>(vec![5, 6, 7]);
        assert_eq!(delays_of(&schedule, &deps, 10), vec![5, 6, 7]);
    }

    #[test]
    fn fixed_aligns_to_windows_and_skips_when_behind() {
        let clock = Arc::new(ManualClock::new(0));
        let deps = test_deps(clock.clone());
        let schedule = fixed::<()>(100);
        let mut step = schedule.step(&deps);

        // First step at t=0: wait until the first boundary.
        assert_eq!(step(&()), Next::Continue { output: 0, delay: 100 });

        // On time at t=100: wait a full window.
        clock.set(100);
        assert_eq!(step(&()), Next::Continue { output: 1, delay: 100 });

        // Badly behind at t=450 (window 2 long gone): skip the delay.
        clock.set(450);
        assert_eq!(step(&()), Next::Continue { output: 2, delay: 0 });
    }

    #[test]
    fn windowed_always_waits_for_the_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let deps = test_deps(clock.clone());
        let schedule = windowed::<()>(100);
        let mut step = schedule.step(&deps);

        assert_eq!(step(&()), Next::Continue { output: 0, delay: 100 });
        clock.set(450);
        assert_eq!(step(&()), Next::Continue { output: 1, delay: 50 });
    }

    #[test]
    fn elapsed_and_during_report_time_since_start() {
        let clock = Arc::new(ManualClock::new(1_000));
        let deps = test_deps(clock.clone());

        let mut step = elapsed::<()>().step(&deps);
        assert_eq!(step(&()), Next::Continue { output: 0, delay: 0 });
        clock.advance(70);
        assert_eq!(step(&()), Next::Continue { output: 70, delay: 0 });

        let mut step = during::<()>(100).step(&deps);
        assert!(matches!(step(&()), Next::Continue { output: 0, .. }));
        clock.advance(100);
        assert_eq!(step(&()), Next::Done);
    }

    #[test]
    fn succeed_and_unfold_produce_outputs() {
        let deps = static_deps();
        let outputs: Vec<&str> = run(&succeed("ok"), &deps, 3).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec!["ok", "ok", "ok"]);

        let doubling = unfold::<(), u64>(1, |n| n * 2);
        let outputs: Vec<u64> = run(&doubling, &deps, 4).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![1, 2, 4, 8]);
    }

    #[test]
    fn max_delay_caps_and_add_delay_extends() {
        let deps = static_deps();
        let capped = exponential::<()>(100).take(5).max_delay(250);
        assert_eq!(delays_of(&capped, &deps, 10), vec![100, 200, 250, 250, 250]);

        let extended = spaced::<()>(10).take(2).add_delay(5);
        assert_eq!(delays_of(&extended, &deps, 10), vec![15, 15]);

        let delayed = spaced::<()>(10).take(3).delayed(100);
        assert_eq!(delays_of(&delayed, &deps, 10), vec![110, 10, 10]);
    }

    #[test]
    fn max_elapsed_cuts_off_by_wall_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let deps = test_deps(clock.clone());
        let schedule = forever::<()>().max_elapsed(100);
        let mut step = schedule.step(&deps);

        assert!(matches!(step(&()), Next::Continue { .. }));
        clock.advance(100);
        assert!(matches!(step(&()), Next::Continue { .. }));
        clock.advance(1);
        assert_eq!(step(&()), Next::Done);
    }

    #[test]
    fn jitter_scales_within_the_factor_band() {
        let deps = static_deps();
        let schedule = spaced::<()>(1_000).take(50).jitter(0.5);
        for delay in delays_of(&schedule, &deps, 50) {
            assert!((500..=1_500).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn full_jitter_never_goes_negative() {
        let deps = static_deps();
        let schedule = spaced::<()>(100).take(50).jitter(1.0);
        for delay in delays_of(&schedule, &deps, 50) {
            assert!(delay <= 200);
        }
    }

    #[test]
    fn compensate_execution_subtracts_work_time() {
        let clock = Arc::new(ManualClock::new(0));
        let deps = test_deps(clock.clone());
        let schedule = spaced::<()>(100).compensate_execution();
        let mut step = schedule.step(&deps);

        assert_eq!(step(&()), Next::Continue { output: 0, delay: 100 });
        // Caller slept 100 and then worked 30 before stepping again.
        clock.set(130);
        assert_eq!(step(&()), Next::Continue { output: 1, delay: 70 });
    }

    #[test]
    fn input_filters_gate_stepping() {
        let deps = static_deps();
        let schedule = forever::<i32>().while_input(|n| *n < 3);
        let mut step = schedule.step(&deps);
        assert!(matches!(step(&0), Next::Continue { .. }));
        assert!(matches!(step(&2), Next::Continue { .. }));
        assert_eq!(step(&3), Next::Done);

        let schedule = forever::<i32>().until_input(|n| *n == 1);
        let mut step = schedule.step(&deps);
        assert!(matches!(step(&0), Next::Continue { .. }));
        assert_eq!(step(&1), Next::Done);
    }

    #[test]
    fn output_filters_gate_continuation() {
        let deps = static_deps();
        let schedule = forever::<()>().while_output(|n| *n < 2);
        let outputs: Vec<u64> = run(&schedule, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 1]);

        let schedule = forever::<()>().until_output(|n| *n == 3);
        let outputs: Vec<u64> = run(&schedule, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 1, 2]);
    }

    #[test]
    fn map_fold_repetitions_and_collectors() {
        let deps = static_deps();

        let doubled = recurs::<()>(3).map(|n| n * 2);
        let outputs: Vec<u64> = run(&doubled, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 2, 4]);

        let sums = recurs::<()>(3).fold(0u64, |acc, n| acc + n);
        let outputs: Vec<u64> = run(&sums, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 1, 3]);

        let reps = spaced::<()>(9).take(3).repetitions();
        let outputs: Vec<u64> = run(&reps, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![0, 1, 2]);

        let collected = recurs::<()>(3).collect_all_outputs();
        let outputs: Vec<Vec<u64>> = run(&collected, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![vec![0], vec![0, 1], vec![0, 1, 2]]);

        let until = forever::<()>().collect_until(|n| *n == 2);
        let outputs: Vec<Vec<u64>> = run(&until, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![vec![0], vec![0, 1]]);
    }

    #[test]
    fn delays_exposes_the_cadence_as_output() {
        let deps = static_deps();
        let schedule = exponential::<()>(100).take(3).delays();
        let outputs: Vec<Millis> = run(&schedule, &deps, 10).into_iter().map(|(o, _)| o).collect();
        assert_eq!(outputs, vec![100, 200, 400]);
    }

    #[test]
    fn passthrough_and_collect_inputs() {
        let deps = static_deps();
        let schedule = recurs::<i32>(3).passthrough();
        let mut step = schedule.step(&deps);
        assert_eq!(step(&7), Next::Continue { output: 7, delay: 0 });
        assert_eq!(step(&9), Next::Continue { output: 9, delay: 0 });

        let schedule = recurs::<i32>(2).collect_inputs();
        let mut step = schedule.step(&deps);
        assert_eq!(
            step(&1),
            Next::Continue {
                output: vec![1],
                delay: 0
            }
        );
        assert_eq!(
            step(&2),
            Next::Continue {
                output: vec![1, 2],
                delay: 0
            }
        );
        assert_eq!(step(&3), Next::Done);
    }

    #[test]
    fn taps_observe_without_changing_behavior() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let deps = static_deps();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in = seen.clone();
        let seen_out = seen.clone();

        let schedule = recurs::<()>(3)
            .tap_input(move |_| {
                seen_in.fetch_add(1, Ordering::SeqCst);
            })
            .tap_output(move |_| {
                seen_out.fetch_add(10, Ordering::SeqCst);
            });
        assert_eq!(run(&schedule, &deps, 10).len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 4 * 1 + 3 * 10);
    }

    #[test]
    fn reset_after_restarts_idle_state() {
        let clock = Arc::new(ManualClock::new(0));
        let deps = test_deps(clock.clone());
        let schedule = exponential::<()>(100).reset_after(1_000);
        let mut step = schedule.step(&deps);

        assert_eq!(step(&()), Next::Continue { output: 0, delay: 100 });
        clock.advance(100);
        assert_eq!(step(&()), Next::Continue { output: 1, delay: 200 });

        // A long quiet period resets the backoff.
        clock.advance(5_000);
        assert_eq!(step(&()), Next::Continue { output: 0, delay: 100 });
    }

    #[test]
    fn sequence_runs_one_then_the_other() {
        let deps = static_deps();
        let schedule = from_delays::<()>(vec![1, 2]).sequence(from_delays(vec![9]));
        assert_eq!(delays_of(&schedule, &deps, 10), vec![1, 2, 9]);
    }

    #[test]
    fn intersect_needs_both_and_takes_the_longer_delay() {
        let deps = static_deps();
        let schedule = spaced::<()>(10).take(5).intersect(spaced(25).take(2));
        let steps = run(&schedule, &deps, 10);
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|(_, delay)| *delay == 25));
        assert_eq!(steps[1].0, (1, 1));
    }

    #[test]
    fn union_outlives_both_and_takes_the_shorter_delay() {
        let deps = static_deps();
        let schedule = spaced::<()>(10).take(2).union(spaced(25).take(4));
        let delays = delays_of(&schedule, &deps, 10);
        assert_eq!(delays, vec![10, 10, 25, 25]);
    }

    #[test]
    fn when_input_routes_between_schedules() {
        let deps = static_deps();
        let schedule = spaced::<i32>(10).when_input(|n| *n < 0, spaced(99));
        let mut step = schedule.step(&deps);
        assert_eq!(step(&1), Next::Continue { output: 0, delay: 10 });
        assert_eq!(step(&-1), Next::Continue { output: 0, delay: 99 });
        assert_eq!(step(&2), Next::Continue { output: 1, delay: 10 });
    }

    #[test]
    fn factory_calls_are_independent() {
        let deps = static_deps();
        let schedule = exponential::<()>(100).take(3);

        let first = delays_of(&schedule, &deps, 10);
        let second = delays_of(&schedule, &deps, 10);
        assert_eq!(first, second);
    }

    #[test]
    fn aws_presets_have_the_documented_shape() {
        let deps = static_deps();

        let steps = run(&retry_strategy_aws::<()>(), &deps, 10);
        assert_eq!(steps.len(), 2);
        for (n, (_, delay)) in steps.iter().enumerate() {
            let base = 100u64 << n;
            assert!(*delay <= base * 2, "jittered delay within twice the base");
        }

        let steps = run(&retry_strategy_aws_throttled::<()>(), &deps, 10);
        assert_eq!(steps.len(), 2);
    }
}
