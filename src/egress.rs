//! Response egress queue adapter (§4.F): a bounded MPSC queue shared with a
//! transport collaborator. Push is best-effort; on overflow the response is
//! dropped, since the queue's own receiver waking on send already gives the
//! "notify on successful push" behaviour the spec calls for.

use tokio::sync::mpsc;
use tracing::warn;

use crate::command::CommandResponse;

#[derive(Clone)]
pub struct ResponseEgress {
    sender: mpsc::Sender<CommandResponse>,
}

impl ResponseEgress {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CommandResponse>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Non-blocking push. Drops and logs on a full or closed queue rather
    /// than backpressuring the caller.
    pub fn push(&self, response: CommandResponse) {
        if let Err(e) = self.sender.try_send(response) {
            warn!(error = %e, "dropping command response, egress queue unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;

    fn response(command_id: &str) -> CommandResponse {
        CommandResponse {
            command_id: command_id.to_string(),
            status: CommandStatus::Succeeded,
            reason_code: 0,
            reason_description: String::new(),
        }
    }

    #[tokio::test]
    async fn pushed_response_is_observed_by_receiver() {
        let (egress, mut rx) = ResponseEgress::channel(4);
        egress.push(response("A"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.command_id, "A");
    }

    #[tokio::test]
    async fn push_drops_silently_once_queue_is_full() {
        let (egress, mut rx) = ResponseEgress::channel(1);
        egress.push(response("A"));
        egress.push(response("B"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.command_id, "A");
        assert!(rx.try_recv().is_err());
    }
}
