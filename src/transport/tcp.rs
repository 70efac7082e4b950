//! TCP transport implementation.
//!
//! A plain tokio `TcpStream` split into two tasks:
//!
//! - the reader turns socket reads into `Data`, `Closed` and `Error` events
//! - the writer drains an unbounded queue of outbound chunks and reports
//!   each write's outcome back to the caller of `send()`
//!
//! Connecting is bounded by the connect timeout given at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::async_result::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    ProviderError,
    RemoteUri,
    Result,
    Transport,
    TransportEvent,
    TransportEvents,
    TransportPtr,
};

/// Port used when the URI names none.
pub const DEFAULT_PORT: u16 = 5672;

const READ_BUFFER_SIZE: usize = 64 * 1024;

type WriteRequest = (Bytes, oneshot::Sender<Result<()>>);

struct Tasks {
    writer: mpsc::UnboundedSender<WriteRequest>,
    handles: Vec<JoinHandle<()>>,
}

struct TcpTransport {
    // ---
    remote: RemoteUri,
    connect_timeout: Option<Duration>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Option<Tasks>>,
}

impl TcpTransport {
    fn address(&self) -> String {
        // ---
        let port = self.remote.port().unwrap_or(DEFAULT_PORT);
        format!("{}:{}", self.remote.host(), port)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    // ---

    fn remote(&self) -> &RemoteUri {
        &self.remote
    }

    async fn connect(&self, events: TransportEvents) -> Result<()> {
        // ---
        let address = self.address();
        log_debug!("TCP transport connecting to {address}");

        let connect = TcpStream::connect(address.as_str());
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ProviderError::connection(format!("connect to {address} timed out")))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;

        let (mut read_half, mut write_half) = stream.into_split();
        self.connected.store(true, Ordering::SeqCst);

        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            // ---
            loop {
                let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(_) => {
                        if events.send(TransportEvent::Data(buf.freeze())).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Error(err.into()));
                        break;
                    }
                }
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriteRequest>();
        let writer = tokio::spawn(async move {
            // ---
            while let Some((data, done)) = writer_rx.recv().await {
                let result = write_half.write_all(&data).await.map_err(ProviderError::from);
                let _ = done.send(result);
            }
            let _ = write_half.shutdown().await;
        });

        *lock_ignore_poison(&self.tasks) = Some(Tasks {
            writer: writer_tx,
            handles: vec![reader, writer],
        });

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        // ---
        let (done_tx, done_rx) = oneshot::channel();
        {
            let tasks = lock_ignore_poison(&self.tasks);
            let Some(tasks) = tasks.as_ref() else {
                return Err(ProviderError::connection("transport not connected"));
            };
            tasks
                .writer
                .send((data, done_tx))
                .map_err(|_| ProviderError::connection("transport writer stopped"))?;
        }

        done_rx
            .await
            .map_err(|_| ProviderError::connection("transport writer stopped"))?
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.connected.store(false, Ordering::SeqCst);
        let tasks = lock_ignore_poison(&self.tasks).take();
        if let Some(tasks) = tasks {
            drop(tasks.writer);
            for handle in tasks.handles {
                handle.abort();
            }
        }
        Ok(())
    }
}

/// Create a TCP transport for `remote`.
pub fn create_transport(remote: RemoteUri, connect_timeout: Option<Duration>) -> TransportPtr {
    // ---
    Arc::new(TcpTransport {
        remote,
        connect_timeout,
        connected: Arc::new(AtomicBool::new(false)),
        tasks: Mutex::new(None),
    })
}
