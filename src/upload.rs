use crate::actors::messages::InternalMessage;
use crate::transport::UploadStream;
use futures_util::StreamExt;
use log::{debug, info};
use relay_core::request::RequestId;
use tokio::sync::mpsc;

pub(crate) struct UploadJob {
    pub request_id: RequestId,
    pub serial: u64,
    pub stream: UploadStream,
}

/// Spawns the single upload worker and returns its job queue.
///
/// Jobs run strictly one after another, so only one file is ever being
/// pushed to the transport. Progress is reported back to the connection
/// manager's mailbox; the worker never touches request state itself.
pub(crate) fn spawn_upload_worker(
    mailbox: mpsc::UnboundedSender<InternalMessage>,
) -> mpsc::UnboundedSender<UploadJob> {
    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<UploadJob>();

    tokio::spawn(async move {
        while let Some(mut job) = job_rx.recv().await {
            debug!(target: "Relay/Upload", "Starting upload for request {}", job.request_id);
            while let Some(update) = job.stream.next().await {
                let failed = update.is_err();
                let message = InternalMessage::UploadProgress {
                    request_id: job.request_id,
                    serial: job.serial,
                    update,
                };
                if mailbox.send(message).is_err() {
                    info!(target: "Relay/Upload", "Connection manager stopped, exiting upload worker");
                    return;
                }
                if failed {
                    break;
                }
            }
            debug!(target: "Relay/Upload", "Upload stream for request {} finished", job.request_id);
        }
    });

    job_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use relay_core::error::MessageSendError;
    use relay_core::types::AttachmentUploadEvent;

    fn progress(sent: u64) -> Result<AttachmentUploadEvent, MessageSendError> {
        Ok(AttachmentUploadEvent::Progress { sent, total: 10 })
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let (mailbox, mut rx) = mpsc::unbounded_channel();
        let jobs = spawn_upload_worker(mailbox);

        jobs.send(UploadJob {
            request_id: RequestId(1),
            serial: 1,
            stream: stream::iter(vec![progress(5), progress(10)]).boxed(),
        })
        .unwrap();
        jobs.send(UploadJob {
            request_id: RequestId(2),
            serial: 2,
            stream: stream::iter(vec![progress(10)]).boxed(),
        })
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                InternalMessage::UploadProgress { request_id, .. } => seen.push(request_id),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(seen, vec![RequestId(1), RequestId(1), RequestId(2)]);
    }

    #[tokio::test]
    async fn test_error_stops_the_job() {
        let (mailbox, mut rx) = mpsc::unbounded_channel();
        let jobs = spawn_upload_worker(mailbox);

        jobs.send(UploadJob {
            request_id: RequestId(1),
            serial: 1,
            stream: stream::iter(vec![Err(MessageSendError::Io), progress(10)]).boxed(),
        })
        .unwrap();
        jobs.send(UploadJob {
            request_id: RequestId(2),
            serial: 2,
            stream: stream::iter(vec![progress(1)]).boxed(),
        })
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            InternalMessage::UploadProgress {
                update: Err(MessageSendError::Io),
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            InternalMessage::UploadProgress {
                request_id: RequestId(2),
                ..
            }
        ));
    }
}
