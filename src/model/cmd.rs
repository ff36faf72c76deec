use super::{Msg, PamOutcome, PamStatus};
use futures::future::BoxFuture;
use std::{fmt, future::Future, time::Duration};

/// Deferred work returned by message handlers. Commands run outside the handler and report back
/// through the message queue.
pub(crate) enum Cmd {
    None,
    /// Enqueue a message.
    Msg(Msg),
    /// Run a future, then the command it resolves to.
    Task(BoxFuture<'static, Cmd>),
    /// Run commands one after the other. A task blocks the commands after it until it resolved.
    Sequence(Vec<Cmd>),
    /// Run commands concurrently.
    Batch(Vec<Cmd>),
    /// Run a command after a delay.
    After(Duration, Box<Cmd>),
    /// Stop the message loop.
    Quit,
}

impl Cmd {
    pub(crate) fn task<F>(future: F) -> Cmd
    where
        F: Future<Output = Cmd> + Send + 'static,
    {
        Cmd::Task(Box::pin(future))
    }

    pub(crate) fn exit(status: PamStatus, message: impl Into<String>) -> Cmd {
        Cmd::Msg(Msg::Exit(PamOutcome::error(status, message)))
    }

    pub(crate) fn after(delay: Duration, cmd: Cmd) -> Cmd {
        Cmd::After(delay, Box::new(cmd))
    }

    pub(crate) fn sequence(cmds: impl IntoIterator<Item = Cmd>) -> Cmd {
        Cmd::flatten(cmds, Cmd::Sequence)
    }

    pub(crate) fn batch(cmds: impl IntoIterator<Item = Cmd>) -> Cmd {
        Cmd::flatten(cmds, Cmd::Batch)
    }

    fn flatten(cmds: impl IntoIterator<Item = Cmd>, wrap: fn(Vec<Cmd>) -> Cmd) -> Cmd {
        let mut cmds: Vec<Cmd> = cmds.into_iter().filter(|cmd| !cmd.is_none()).collect();
        match cmds.len() {
            0 => Cmd::None,
            1 => cmds.remove(0),
            _ => wrap(cmds),
        }
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Cmd::None)
    }
}

impl From<Msg> for Cmd {
    fn from(msg: Msg) -> Cmd {
        Cmd::Msg(msg)
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::None => write!(f, "None"),
            Cmd::Msg(msg) => write!(f, "Msg({})", msg.kind()),
            Cmd::Task(_) => write!(f, "Task"),
            Cmd::Sequence(cmds) => f.debug_tuple("Sequence").field(cmds).finish(),
            Cmd::Batch(cmds) => f.debug_tuple("Batch").field(cmds).finish(),
            Cmd::After(delay, cmd) => f.debug_tuple("After").field(delay).field(cmd).finish(),
            Cmd::Quit => write!(f, "Quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_commands_collapse() {
        assert!(Cmd::sequence([Cmd::None, Cmd::None]).is_none());
        assert!(matches!(Cmd::batch([Cmd::None, Cmd::Quit]), Cmd::Quit));
        assert!(matches!(
            Cmd::sequence([Msg::GoBack.into(), Cmd::None, Cmd::Quit]),
            Cmd::Sequence(cmds) if cmds.len() == 2
        ));
    }
}
