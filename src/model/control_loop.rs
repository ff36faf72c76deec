use super::{Cmd, Model, Msg, PamOutcome};
use futures::{FutureExt, future::BoxFuture};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// Runs `model` until it quits and returns its exit status.
///
/// Messages are handled strictly one at a time. Commands returned by the handler run on spawned
/// tasks and post their messages back to the same queue.
pub(crate) async fn run(mut model: Model) -> PamOutcome {
    let logger = model.logger().clone();
    let (inbox, mut messages) = unbounded_channel::<Msg>();

    dispatch(model.init(), &inbox);

    slog::debug!(logger, "Starting control loop");
    while let Some(msg) = messages.recv().await {
        if let Msg::Quit = msg {
            slog::debug!(logger, "Quit received");
            break;
        }
        slog::debug!(logger, "Handling message"; "msg" => msg.kind(), "stage" => %model.stage());
        let cmd = model.update(msg);
        dispatch(cmd, &inbox);
    }

    model.exit_status()
}

fn dispatch(cmd: Cmd, inbox: &UnboundedSender<Msg>) {
    match cmd {
        Cmd::None => {}
        Cmd::Msg(msg) => send(inbox, msg),
        Cmd::Quit => send(inbox, Msg::Quit),
        Cmd::Batch(cmds) => {
            for cmd in cmds {
                dispatch(cmd, inbox);
            }
        }
        cmd => {
            tokio::spawn(execute(cmd, inbox.clone()));
        }
    }
}

fn execute(cmd: Cmd, inbox: UnboundedSender<Msg>) -> BoxFuture<'static, ()> {
    async move {
        match cmd {
            Cmd::None => {}
            Cmd::Msg(msg) => send(&inbox, msg),
            Cmd::Quit => send(&inbox, Msg::Quit),
            Cmd::Task(task) => execute(task.await, inbox).await,
            Cmd::Sequence(cmds) => {
                for cmd in cmds {
                    execute(cmd, inbox.clone()).await;
                }
            }
            Cmd::Batch(cmds) => {
                for cmd in cmds {
                    dispatch(cmd, &inbox);
                }
            }
            Cmd::After(delay, cmd) => {
                tokio::time::sleep(delay).await;
                execute(*cmd, inbox).await;
            }
        }
    }
    .boxed()
}

// The queue outlives the loop only for commands still running after quit.
fn send(inbox: &UnboundedSender<Msg>, msg: Msg) {
    let _ = inbox.send(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread")]
    async fn sequences_keep_their_order() {
        let (inbox, mut messages) = unbounded_channel();
        let slow = Cmd::task(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Msg::UserRequired.into()
        });
        dispatch(
            Cmd::sequence([slow, Msg::GoBack.into(), Cmd::after(Duration::from_millis(1), Cmd::Quit)]),
            &inbox,
        );

        let mut kinds = vec![];
        for _ in 0..3 {
            kinds.push(messages.recv().await.unwrap().kind());
        }
        assert_eq!(kinds, vec!["UserRequired", "GoBack", "Quit"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn plain_messages_are_queued_immediately() {
        let (inbox, mut messages) = unbounded_channel();
        dispatch(Cmd::batch([Msg::RelayPollDone.into(), Msg::SessionEnded.into()]), &inbox);
        assert_eq!(messages.try_recv().unwrap().kind(), "RelayPollDone");
        assert_eq!(messages.try_recv().unwrap().kind(), "SessionEnded");
    }
}
