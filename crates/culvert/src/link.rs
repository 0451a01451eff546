//! One TCP connection plus framing state.
//!
//! A [`Link`] splits its stream: the write half sits behind a lock so any
//! task may send, and the read half moves into a spawned reader task that
//! decodes whole messages into the owning tunnel's intake channel. The
//! reader task is the only consumer of the read half.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use culvert_core::{Message, TransportError, read_message, write_message};

/// What a reader task feeds into the tunnel.
#[derive(Debug)]
pub(crate) enum Intake {
    /// A fully decoded message from one of the tunnel's links.
    Message { link: usize, msg: Message },
    /// The link at `link` stopped producing messages for good.
    Retired { link: usize },
}

pub struct Link {
    index: usize,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    alive: AtomicBool,
}

impl Link {
    /// Wrap `stream` and spawn its reader task.
    pub(crate) fn spawn<S>(index: usize, stream: S, intake: mpsc::Sender<Intake>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let link = Arc::new(Self {
            index,
            writer: AsyncMutex::new(Box::new(writer)),
            alive: AtomicBool::new(true),
        });
        tokio::spawn(read_loop(reader, intake, link.clone()));
        link
    }

    /// Whether the reader side has observed a disconnect. A retired link
    /// leaves the tunnel's send rotation.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Serialize `msg` and write it. Writes are serialized per link; the
    /// caller may be any task.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg).await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("index", &self.index)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(mut reader: R, intake: mpsc::Sender<Intake>, link: Arc<Link>)
where
    R: AsyncRead + Unpin + Send,
{
    let index = link.index;
    loop {
        match read_message(&mut reader).await {
            Ok(msg) => {
                tracing::trace!(link = index, kind = msg.kind(), "link message");
                if intake.send(Intake::Message { link: index, msg }).await.is_err() {
                    // Tunnel gone; nobody left to deliver to.
                    break;
                }
            }
            Err(TransportError::Closed) => {
                tracing::debug!(link = index, "link closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(link = index, error = %e, "link read failed; retiring link");
                break;
            }
        }
    }
    link.retire();
    let _ = intake.send(Intake::Retired { link: index }).await;
}
