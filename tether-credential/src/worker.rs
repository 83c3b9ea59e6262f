//! Asynchronous mode (§4.6) — an opt-in command channel to a single
//! worker task that owns the [`CredentialEngine`] and processes one
//! command at a time, generalizing the original authenticator's
//! socketpair-and-event-loop design onto a `tokio::sync::mpsc` channel.

use crate::engine::{CredentialEngine, KeyId};
use crate::error::Error;
use tokio::sync::{mpsc, oneshot};

/// Event tags published alongside each command's completion, matching
/// the original authenticator's notification values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventTag {
    PrepareDone = 0x0801_0100,
    PrepareError = 0x0801_0200,
    DeactivateDone = 0x0802_0100,
    DeactivateError = 0x0802_0200,
    CryptoDone = 0x0804_0100,
    CryptoError = 0x0804_0200,
}

/// An event published on the worker's notification endpoint.
#[derive(Debug, Clone)]
pub struct Event {
    pub tag: EventTag,
    pub detail: Option<String>,
}

enum CryptoOp {
    Encrypt,
    Decrypt,
}

enum Command {
    Generate,
    Cleanup,
    Crypto {
        id: KeyId,
        op: CryptoOp,
        data: Vec<u8>,
        iv: Option<Vec<u8>>,
    },
    GetKey(KeyId),
    GenerateSign(Vec<u8>),
    VerifySign {
        signature: Vec<u8>,
        data: Vec<u8>,
    },
}

/// Reply payloads for commands that produce a value synchronously
/// readable via the returned future (`get_result`/`get_key` callers in
/// the spec read a second channel; here that's just the future itself).
pub enum Reply {
    Unit,
    Bytes(Vec<u8>),
    Authentic(bool),
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<Reply, Error>>,
}

/// Handle to a running Credential Engine worker. Cloning shares the same
/// underlying engine and event stream.
#[derive(Clone)]
pub struct AsyncEngine {
    commands: mpsc::Sender<Request>,
    events: mpsc::UnboundedSender<Event>,
}

impl AsyncEngine {
    /// Spawn the worker task, taking ownership of an already-configured
    /// (but not yet necessarily activated) engine. Returns the handle and
    /// the event receiver for the notification endpoint.
    pub fn spawn(mut engine: CredentialEngine) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (command_tx, mut command_rx) = mpsc::channel::<Request>(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let events_for_worker = event_tx.clone();

        tokio::spawn(async move {
            while let Some(Request { command, reply }) = command_rx.recv().await {
                let (result, event) = run_command(&mut engine, command);
                if let Some(event) = event {
                    let _ = events_for_worker.send(event);
                }
                let _ = reply.send(result);
            }
        });

        (
            Self {
                commands: command_tx,
                events: event_tx,
            },
            event_rx,
        )
    }

    async fn call(&self, command: Command) -> Result<Reply, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Request {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SequenceError("credential engine worker has shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::SequenceError("credential engine worker dropped the reply channel".to_string()))?
    }

    /// `GENERATE`: runs `activate` + `prepare` on the worker.
    pub async fn generate(&self) -> Result<(), Error> {
        self.call(Command::Generate).await.map(|_| ())
    }

    /// `CLEANUP`: runs `deactivate` on the worker.
    pub async fn cleanup(&self) -> Result<(), Error> {
        self.call(Command::Cleanup).await.map(|_| ())
    }

    /// `CRYPTO` (encrypt branch).
    pub async fn encrypt(&self, id: KeyId, data: Vec<u8>, iv: Option<Vec<u8>>) -> Result<Vec<u8>, Error> {
        match self
            .call(Command::Crypto {
                id,
                op: CryptoOp::Encrypt,
                data,
                iv,
            })
            .await?
        {
            Reply::Bytes(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }

    /// `CRYPTO` (decrypt branch).
    pub async fn decrypt(&self, id: KeyId, data: Vec<u8>, iv: Option<Vec<u8>>) -> Result<Vec<u8>, Error> {
        match self
            .call(Command::Crypto {
                id,
                op: CryptoOp::Decrypt,
                data,
                iv,
            })
            .await?
        {
            Reply::Bytes(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }

    /// `GETKEY`.
    pub async fn get_key(&self, id: KeyId) -> Result<Vec<u8>, Error> {
        match self.call(Command::GetKey(id)).await? {
            Reply::Bytes(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }

    /// `GENERATE_SIGN`.
    pub async fn sign(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        match self.call(Command::GenerateSign(data)).await? {
            Reply::Bytes(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }

    /// `VERIFY_SIGN`.
    pub async fn verify(&self, signature: Vec<u8>, data: Vec<u8>) -> Result<bool, Error> {
        match self.call(Command::VerifySign { signature, data }).await? {
            Reply::Authentic(ok) => Ok(ok),
            _ => Ok(false),
        }
    }

    /// Whether the worker task is still alive.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// A handle that other components can clone to publish engine-scoped
    /// diagnostic events (e.g. pipeline bridge failures) on the same bus.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events.clone()
    }
}

fn run_command(engine: &mut CredentialEngine, command: Command) -> (Result<Reply, Error>, Option<Event>) {
    match command {
        Command::Generate => {
            match engine.prepare() {
                Ok(()) => (
                    Ok(Reply::Unit),
                    Some(Event {
                        tag: EventTag::PrepareDone,
                        detail: None,
                    }),
                ),
                Err(e) => {
                    let detail = e.to_string();
                    (
                        Err(e),
                        Some(Event {
                            tag: EventTag::PrepareError,
                            detail: Some(detail),
                        }),
                    )
                }
            }
        }
        Command::Cleanup => match engine.deactivate() {
            Ok(()) => (
                Ok(Reply::Unit),
                Some(Event {
                    tag: EventTag::DeactivateDone,
                    detail: None,
                }),
            ),
            Err(e) => {
                let detail = e.to_string();
                (
                    Err(e),
                    Some(Event {
                        tag: EventTag::DeactivateError,
                        detail: Some(detail),
                    }),
                )
            }
        },
        Command::Crypto { id, op, data, iv } => {
            let outcome = match op {
                CryptoOp::Encrypt => engine.encrypt(id, &data, iv.as_deref()),
                CryptoOp::Decrypt => engine.decrypt(id, &data, iv.as_deref()),
            };
            match outcome.and_then(|_| engine.get_result().map(|b| b.to_vec())) {
                Ok(bytes) => (
                    Ok(Reply::Bytes(bytes)),
                    Some(Event {
                        tag: EventTag::CryptoDone,
                        detail: None,
                    }),
                ),
                Err(e) => {
                    let detail = e.to_string();
                    (
                        Err(e),
                        Some(Event {
                            tag: EventTag::CryptoError,
                            detail: Some(detail),
                        }),
                    )
                }
            }
        }
        Command::GetKey(id) => (engine.get_key(id).map(Reply::Bytes), None),
        Command::GenerateSign(data) => (engine.sign(&data).map(Reply::Bytes), None),
        Command::VerifySign { signature, data } => {
            (engine.verify(&signature, &data).map(Reply::Authentic), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConfigureKind;

    fn configured_engine() -> CredentialEngine {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine
    }

    #[tokio::test]
    async fn generate_then_sign_round_trip() {
        let (handle, mut events) = AsyncEngine::spawn(configured_engine());
        handle.generate().await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.tag as u32, EventTag::PrepareDone as u32);

        let signature = handle.sign(b"payload".to_vec()).await.unwrap();
        assert!(handle.verify(signature, b"payload".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn crypto_command_round_trips_secret_key() {
        let (handle, _events) = AsyncEngine::spawn(configured_engine());
        handle.generate().await.unwrap();

        let iv = vec![0u8; 16];
        let ciphertext = handle
            .encrypt(KeyId::SecretKey, b"hello".to_vec(), Some(iv.clone()))
            .await
            .unwrap();
        let plaintext = handle
            .decrypt(KeyId::SecretKey, ciphertext, Some(iv))
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");
    }
}
