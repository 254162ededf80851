//! Table-driven finite-state-machine driver.
//!
//! A [`Machine`] is a table of [`Transition`]s keyed by `(source, dest)`.
//! Running it keeps a `(prev, curr)` pair, looks up the entry matching that
//! pair, awaits its action, and moves to the state the action returns:
//!
//! ```text
//!   (START, initial) ──action──▶ (initial, next) ──action──▶ ... ──▶ EXIT
//! ```
//!
//! Actions receive the machine's context by `&mut` together with the value
//! produced by the previous step, and return a [`Step`]: the next state plus
//! the value to hand to the next action.  Each protocol defines its own
//! carried type (an enum), so the shape of the data flowing between two
//! states is known statically.
//!
//! The driver never performs I/O; any suspension happens inside actions.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Boxed, sendable future returned by actions.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A state type usable by [`Machine`].
///
/// `START` is the implicit predecessor of the initial state; reaching `EXIT`
/// ends the run.
pub trait MachineState: Copy + Eq + Debug {
    const START: Self;
    const EXIT: Self;
}

/// Result of one action: where to go next and what to carry there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<S, D> {
    pub next: S,
    pub data: D,
}

impl<S, D> Step<S, D> {
    pub fn with(next: S, data: D) -> Self {
        Self { next, data }
    }
}

impl<S, D: Default> Step<S, D> {
    /// Move to `next` carrying the default value.
    pub fn to(next: S) -> Self {
        Self {
            next,
            data: D::default(),
        }
    }
}

/// Action run when the machine moves from `source` into `dest`.
pub type Action<C, S, D, E> = for<'a> fn(&'a mut C, D) -> BoxFuture<'a, Result<Step<S, D>, E>>;

/// One row of a transition table.
pub struct Transition<C, S, D, E> {
    pub source: S,
    pub dest: S,
    action: Action<C, S, D, E>,
}

impl<C, S, D, E> Transition<C, S, D, E> {
    pub fn new(source: S, dest: S, action: Action<C, S, D, E>) -> Self {
        Self {
            source,
            dest,
            action,
        }
    }
}

/// Malformed transition tables and runs that leave them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("[{machine}] transition from {from} to {to} is not defined")]
    UndefinedTransition {
        machine: &'static str,
        from: String,
        to: String,
    },
    #[error("[{machine}] transition from {from} to {to} is defined more than once")]
    DuplicateTransition {
        machine: &'static str,
        from: String,
        to: String,
    },
    #[error("[{machine}] state {state} cannot handle the carried value {data}")]
    UnexpectedData {
        machine: &'static str,
        state: String,
        data: String,
    },
}

impl FsmError {
    /// Build an [`FsmError::UnexpectedData`] for an action that was handed a
    /// variant it has no use for.
    pub fn unexpected(machine: &'static str, state: impl Debug, data: impl Debug) -> Self {
        FsmError::UnexpectedData {
            machine,
            state: format!("{state:?}"),
            data: format!("{data:?}"),
        }
    }
}

/// A validated transition table.
pub struct Machine<C, S, D, E> {
    name: &'static str,
    table: Vec<Transition<C, S, D, E>>,
}

impl<C, S, D, E> Machine<C, S, D, E>
where
    S: MachineState,
    E: From<FsmError>,
{
    /// Build a machine, rejecting tables with two rows for the same pair.
    pub fn new(name: &'static str, table: Vec<Transition<C, S, D, E>>) -> Result<Self, FsmError> {
        for (i, row) in table.iter().enumerate() {
            if table[..i]
                .iter()
                .any(|other| other.source == row.source && other.dest == row.dest)
            {
                return Err(FsmError::DuplicateTransition {
                    machine: name,
                    from: format!("{:?}", row.source),
                    to: format!("{:?}", row.dest),
                });
            }
        }
        Ok(Self { name, table })
    }

    fn lookup(&self, prev: S, curr: S) -> Option<&Transition<C, S, D, E>> {
        self.table
            .iter()
            .find(|row| row.source == prev && row.dest == curr)
    }

    /// Drive the machine from `initial` until it reaches `S::EXIT`.
    ///
    /// Returns the value carried out of the last action.  A `(prev, curr)`
    /// pair without a table row aborts the run with
    /// [`FsmError::UndefinedTransition`].
    pub async fn run(&self, ctx: &mut C, initial: S, data: D) -> Result<D, E> {
        let mut prev = S::START;
        let mut curr = initial;
        let mut data = data;

        while curr != S::EXIT {
            let row = self.lookup(prev, curr).ok_or_else(|| FsmError::UndefinedTransition {
                machine: self.name,
                from: format!("{prev:?}"),
                to: format!("{curr:?}"),
            })?;
            let step = (row.action)(ctx, data).await?;
            log::trace!("[{}] {prev:?} -> {curr:?} -> {:?}", self.name, step.next);
            prev = curr;
            curr = step.next;
            data = step.data;
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Start,
        Red,
        Green,
        Yellow,
        Exit,
    }

    impl MachineState for Light {
        const START: Self = Light::Start;
        const EXIT: Self = Light::Exit;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    enum Carry {
        #[default]
        Nothing,
        Cycles(u32),
    }

    #[derive(Default)]
    struct Junction {
        visited: Vec<Light>,
        limit: u32,
    }

    type Outcome<'a> = BoxFuture<'a, Result<Step<Light, Carry>, FsmError>>;

    fn red(ctx: &mut Junction, data: Carry) -> Outcome<'_> {
        Box::pin(async move {
            ctx.visited.push(Light::Red);
            let cycles = match data {
                Carry::Nothing => 0,
                Carry::Cycles(n) => n,
            };
            if cycles >= ctx.limit {
                Ok(Step::with(Light::Exit, Carry::Cycles(cycles)))
            } else {
                Ok(Step::with(Light::Green, Carry::Cycles(cycles)))
            }
        })
    }

    fn green(ctx: &mut Junction, data: Carry) -> Outcome<'_> {
        Box::pin(async move {
            ctx.visited.push(Light::Green);
            Ok(Step::with(Light::Yellow, data))
        })
    }

    fn yellow(ctx: &mut Junction, data: Carry) -> Outcome<'_> {
        Box::pin(async move {
            ctx.visited.push(Light::Yellow);
            match data {
                Carry::Cycles(n) => Ok(Step::with(Light::Red, Carry::Cycles(n + 1))),
                other => Err(FsmError::unexpected("lights", Light::Yellow, other)),
            }
        })
    }

    fn skip_to_yellow(_ctx: &mut Junction, _data: Carry) -> Outcome<'_> {
        Box::pin(async move { Ok(Step::to(Light::Yellow)) })
    }

    fn lights(extra: Vec<Transition<Junction, Light, Carry, FsmError>>) -> Machine<Junction, Light, Carry, FsmError> {
        let mut table = vec![
            Transition::new(Light::Start, Light::Red, red),
            Transition::new(Light::Red, Light::Green, green),
            Transition::new(Light::Green, Light::Yellow, yellow),
            Transition::new(Light::Yellow, Light::Red, red),
        ];
        table.extend(extra);
        Machine::new("lights", table).unwrap()
    }

    #[tokio::test]
    async fn threads_data_until_exit() {
        let machine = lights(vec![]);
        let mut ctx = Junction {
            limit: 2,
            ..Default::default()
        };
        let out = machine.run(&mut ctx, Light::Red, Carry::Nothing).await.unwrap();
        assert_eq!(out, Carry::Cycles(2));
        assert_eq!(
            ctx.visited,
            vec![
                Light::Red,
                Light::Green,
                Light::Yellow,
                Light::Red,
                Light::Green,
                Light::Yellow,
                Light::Red,
            ]
        );
    }

    #[tokio::test]
    async fn missing_row_is_an_error() {
        let machine = lights(vec![]);
        let mut ctx = Junction::default();
        let err = machine
            .run(&mut ctx, Light::Green, Carry::Nothing)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FsmError::UndefinedTransition {
                machine: "lights",
                from: "Start".into(),
                to: "Green".into(),
            }
        );
        assert!(ctx.visited.is_empty());
    }

    #[tokio::test]
    async fn action_errors_propagate() {
        // Green -> Yellow is reached with no cycle count, which yellow rejects.
        let machine = lights(vec![Transition::new(Light::Start, Light::Green, green)]);
        let mut ctx = Junction::default();
        let err = machine
            .run(&mut ctx, Light::Green, Carry::Nothing)
            .await
            .unwrap_err();
        assert!(matches!(err, FsmError::UnexpectedData { .. }));
        assert_eq!(ctx.visited, vec![Light::Green, Light::Yellow]);
    }

    #[tokio::test]
    async fn default_step_carries_default_data() {
        let machine = lights(vec![Transition::new(Light::Start, Light::Green, skip_to_yellow)]);
        let mut ctx = Junction::default();
        let err = machine
            .run(&mut ctx, Light::Green, Carry::Cycles(5))
            .await
            .unwrap_err();
        // skip_to_yellow dropped the count, so yellow sees the default.
        assert!(err.to_string().contains("Nothing"));
    }

    #[test]
    fn duplicate_rows_are_rejected() {
        let table: Vec<Transition<Junction, Light, Carry, FsmError>> = vec![
            Transition::new(Light::Start, Light::Red, red),
            Transition::new(Light::Start, Light::Red, green),
        ];
        let err = Machine::new("dup", table).err().unwrap();
        assert!(matches!(err, FsmError::DuplicateTransition { machine: "dup", .. }));
    }
}
