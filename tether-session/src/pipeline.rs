//! Pipeline Bridge (§4.10) and the transport/pipeline-string builder
//! (§4.9, §9 design note on unifying the secured/unsecured pipeline
//! construction).
//!
//! The pipeline engine itself (GStreamer + NNStreamer in the source) is
//! an opaque external collaborator (§1 scope). This module owns the
//! *bridge*: the cooperative worker thread, its command channel, and the
//! pipeline-description builder that would be handed to that engine. A
//! real binary wires [`PipelineEngine`] to the actual library; tests use
//! [`NullPipelineEngine`].

use crate::error::{Error, Result};
use crate::tensor::TensorInfo;
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Opaque token returned by the pipeline engine once a pipeline is built,
/// stored on the `SessionContext` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandle(pub u64);

/// The two wire transports a pipeline leg can ride, unifying what the
/// source previously duplicated as separate secured/unsecured string
/// builders (§9).
#[derive(Debug, Clone)]
pub enum Transport {
    /// Plain TCP, used for the control/tensor leg and for the whole
    /// pipeline when inputs are not configured as media.
    Tcp { host: String, port: u16 },
    /// UDP, optionally wrapped in SRTP when a session key is present.
    Udp {
        host: String,
        port: u16,
        srtp_key: Option<[u8; 30]>,
        ssrc: String,
    },
}

/// Media input kind, selecting the encode/decode elements (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Not media: tensors flow as an opaque framed byte stream over TCP.
    Opaque,
    Image,
    Video,
}

/// Builds the gst-launch-style pipeline description strings §4.9
/// specifies, parameterized over [`Transport`] and [`MediaKind`] so a
/// single routine replaces the source's per-mode duplication.
pub struct PipelineBuilder;

impl PipelineBuilder {
    /// Client-side request leg (Device → Edge).
    pub fn client_request_leg(media: MediaKind, transport: &Transport) -> Result<String> {
        match (media, transport) {
            (MediaKind::Opaque, Transport::Tcp { host, port }) => Ok(format!(
                "appsrc name=src ! gdppay ! tcpclientsink host={host} port={port}"
            )),
            (MediaKind::Image, Transport::Udp { host, port, srtp_key, ssrc }) => {
                Ok(Self::media_udp_sink("jpegenc ! rtpjpegpay", host, *port, srtp_key.as_ref(), ssrc))
            }
            (MediaKind::Video, Transport::Udp { host, port, srtp_key, ssrc }) => {
                Ok(Self::media_udp_sink("vp8enc ! rtpvp8pay", host, *port, srtp_key.as_ref(), ssrc))
            }
            _ => Err(Error::InvalidArgument(
                "media kind and transport combination is not supported".to_string(),
            )),
        }
    }

    fn media_udp_sink(
        encode_and_pay: &str,
        host: &str,
        port: u16,
        srtp_key: Option<&[u8; 30]>,
        ssrc: &str,
    ) -> String {
        let mut stage = format!("appsrc name=src ! {encode_and_pay}");
        if let Some(key) = srtp_key {
            stage.push_str(&format!(" ! srtpenc key=(buffer){} ssrc={ssrc}", hex::encode(key)));
        }
        stage.push_str(&format!(" ! udpsink host={host} port={port}"));
        stage
    }

    /// Client-side response leg (tensor stream back from the Edge),
    /// always TCP+gdp regardless of whether the request leg is media.
    pub fn client_response_leg(host: &str, port: u16) -> String {
        format!(
            "tcpclientsrc host={host} port={port} ! gdpdepay ! tensor_converter ! appsink name=sink"
        )
    }

    /// Server-side mirror: plain mode.
    pub fn server_plain(bind_port: u16) -> String {
        format!(
            "tcpserversrc port={bind_port} ! gdpdepay ! tensor_filter ! gdppay ! tcpserversink"
        )
    }

    /// Server-side mirror: media mode with an SRTP session key, running
    /// inference with `framework`/`model_path` and decoding the result
    /// with the tensor decoder.
    pub fn server_media(
        media: MediaKind,
        bind_port: u16,
        srtp_key: &[u8; 30],
        ssrc: &str,
        framework: &str,
        model_path: &str,
        accelerator: Option<&str>,
    ) -> Result<String> {
        let (encoding_name, depay, decode) = match media {
            MediaKind::Image => ("JPEG", "rtpjpegdepay", "jpegdec"),
            MediaKind::Video => ("VP8", "rtpvp8depay", "vp8dec"),
            MediaKind::Opaque => {
                return Err(Error::InvalidArgument(
                    "server_media requires Image or Video media kind".to_string(),
                ))
            }
        };
        let accel = accelerator.unwrap_or("false:cpu");
        Ok(format!(
            "udpsrc port={bind_port} caps=\"application/x-srtp, encoding-name={encoding_name}, \
             payload=96, ssrc={ssrc}, srtp-key=(buffer){key}, srtp-cipher=aes-128-icm, \
             srtp-auth=hmac-sha1-80, srtcp-cipher=aes-128-icm, srtcp-auth=hmac-sha1-80\" \
             ! srtpdec ! {depay} ! {decode} ! tensor_converter \
             ! tensor_filter framework={framework} model={model_path} accelerator={accel} \
             ! tensor_decoder mode=flatbuf ! gdppay ! tcpserversink",
            key = hex::encode(srtp_key)
        ))
    }
}

/// One in-flight `invoke` request: the tensor buffer plus the caller's
/// opaque user context, queued FIFO-order (§4.9 `pending_requests`).
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub tensor: Vec<u8>,
    pub user_context: u64,
}

/// A completed response, matched to the oldest [`PendingRequest`] when
/// the pipeline callback fires.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub tensor: Vec<u8>,
    pub user_context: u64,
}

/// Commands exchanged between the Peer Session and a pipeline-bridge
/// worker thread (§4.10). `Prepare`/`Invoke` get a synchronous reply with
/// the same opcode; the indirection exists because the pipeline engine
/// needs thread affinity for bus handling.
pub enum Command {
    Ready,
    Prepare { description: String },
    Invoke { tensor: Vec<u8>, user_context: u64 },
    /// Non-blocking poll: has the engine produced an output for the
    /// oldest pending request yet?
    PollOutput,
    Stop,
    Exit,
}

/// Reply to a [`Command`], always carrying the same opcode as the
/// request it answers.
pub enum Reply {
    Ready,
    Prepared { handle: PipelineHandle },
    Invoked,
    Output(Option<PipelineOutput>),
    Stopped,
    Exited,
    Failed(String),
}

/// Abstraction over the external pipeline engine. A production binary
/// implements this against the real media/tensor library; tests use
/// [`NullPipelineEngine`].
pub trait PipelineEngine: Send + 'static {
    /// Build and start a pipeline from its gst-launch-style description,
    /// returning an opaque handle.
    fn prepare(&mut self, description: &str) -> std::result::Result<PipelineHandle, String>;

    /// Push a tensor buffer into the running pipeline's source element.
    fn invoke(&mut self, handle: PipelineHandle, tensor: &[u8]) -> std::result::Result<(), String>;

    /// Non-blocking poll for a completed output, if the engine has one
    /// buffered from its sink callback.
    fn poll_output(&mut self, handle: PipelineHandle) -> Option<Vec<u8>>;

    /// Tear down the pipeline identified by `handle`.
    fn stop(&mut self, handle: PipelineHandle) -> std::result::Result<(), String>;
}

impl PipelineEngine for Box<dyn PipelineEngine> {
    fn prepare(&mut self, description: &str) -> std::result::Result<PipelineHandle, String> {
        (**self).prepare(description)
    }

    fn invoke(&mut self, handle: PipelineHandle, tensor: &[u8]) -> std::result::Result<(), String> {
        (**self).invoke(handle, tensor)
    }

    fn poll_output(&mut self, handle: PipelineHandle) -> Option<Vec<u8>> {
        (**self).poll_output(handle)
    }

    fn stop(&mut self, handle: PipelineHandle) -> std::result::Result<(), String> {
        (**self).stop(handle)
    }
}

/// A pipeline engine that loops tensors back unchanged, used by
/// integration tests exercising the Peer Session's FIFO ordering without
/// a real media library.
#[derive(Default)]
pub struct NullPipelineEngine {
    next_handle: u64,
    queues: std::collections::HashMap<u64, VecDeque<Vec<u8>>>,
}

impl PipelineEngine for NullPipelineEngine {
    fn prepare(&mut self, _description: &str) -> std::result::Result<PipelineHandle, String> {
        self.next_handle += 1;
        self.queues.insert(self.next_handle, VecDeque::new());
        Ok(PipelineHandle(self.next_handle))
    }

    fn invoke(&mut self, handle: PipelineHandle, tensor: &[u8]) -> std::result::Result<(), String> {
        self.queues
            .get_mut(&handle.0)
            .ok_or_else(|| "unknown pipeline handle".to_string())?
            .push_back(tensor.to_vec());
        Ok(())
    }

    fn poll_output(&mut self, handle: PipelineHandle) -> Option<Vec<u8>> {
        self.queues.get_mut(&handle.0)?.pop_front()
    }

    fn stop(&mut self, handle: PipelineHandle) -> std::result::Result<(), String> {
        self.queues.remove(&handle.0);
        Ok(())
    }
}

/// Built but not-yet-started bridge: two-phase construction per §9's
/// design note (`build()` is fallible and side-effect free, `start()`
/// spawns the worker thread and blocks on its `Ready` reply).
pub struct PipelineBridgeBuilder<E: PipelineEngine> {
    engine: E,
}

impl<E: PipelineEngine> PipelineBridgeBuilder<E> {
    pub fn build(engine: E) -> Result<Self> {
        Ok(Self { engine })
    }

    /// Spawn the worker thread and wait for its initial `Ready` message.
    pub fn start(self) -> Result<PipelineBridge> {
        let (command_tx, command_rx) = std_mpsc::channel::<Command>();
        let (reply_tx, reply_rx) = std_mpsc::channel::<Reply>();
        let pending = Arc::new(Mutex::new(VecDeque::<PendingRequest>::new()));
        let worker_pending = Arc::clone(&pending);

        let handle: JoinHandle<()> = std::thread::Builder::new()
            .name("pipeline-bridge".to_string())
            .spawn(move || run_worker(self.engine, command_rx, reply_tx, worker_pending))
            .map_err(|e| Error::CryptoFault(format!("failed to spawn pipeline-bridge thread: {e}")))?;

        let bridge = PipelineBridge {
            commands: command_tx,
            replies: reply_rx,
            pending,
            worker: Some(handle),
        };
        bridge.expect_ready()?;
        Ok(bridge)
    }
}

fn run_worker<E: PipelineEngine>(
    mut engine: E,
    commands: std_mpsc::Receiver<Command>,
    replies: std_mpsc::Sender<Reply>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
) {
    let _ = replies.send(Reply::Ready);
    let mut handle: Option<PipelineHandle> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Ready => {
                let _ = replies.send(Reply::Ready);
            }
            Command::Prepare { description } => match engine.prepare(&description) {
                Ok(h) => {
                    handle = Some(h);
                    let _ = replies.send(Reply::Prepared { handle: h });
                }
                Err(e) => {
                    let _ = replies.send(Reply::Failed(e));
                }
            },
            Command::Invoke { tensor, user_context } => {
                let Some(h) = handle else {
                    let _ = replies.send(Reply::Failed("invoke before prepare".to_string()));
                    continue;
                };
                match engine.invoke(h, &tensor) {
                    Ok(()) => {
                        pending.lock().unwrap().push_back(PendingRequest { tensor, user_context });
                        let _ = replies.send(Reply::Invoked);
                    }
                    Err(e) => {
                        let _ = replies.send(Reply::Failed(e));
                    }
                }
            }
            Command::PollOutput => {
                let output = handle.and_then(|h| {
                    let tensor = engine.poll_output(h)?;
                    let request = pending.lock().unwrap().pop_front()?;
                    let _ = request.tensor; // the request buffer itself isn't echoed back
                    Some(PipelineOutput { tensor, user_context: request.user_context })
                });
                let _ = replies.send(Reply::Output(output));
            }
            Command::Stop => {
                if let Some(h) = handle.take() {
                    let _ = engine.stop(h);
                }
                let _ = replies.send(Reply::Stopped);
            }
            Command::Exit => {
                let _ = replies.send(Reply::Exited);
                break;
            }
        }
    }
}

/// A running pipeline bridge: one worker thread plus its command/reply
/// channels and the `pending_requests` FIFO (§4.9).
pub struct PipelineBridge {
    commands: std_mpsc::Sender<Command>,
    replies: std_mpsc::Receiver<Reply>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
    worker: Option<JoinHandle<()>>,
}

impl PipelineBridge {
    fn expect_ready(&self) -> Result<()> {
        match self.replies.recv() {
            Ok(Reply::Ready) => Ok(()),
            Ok(_) => Err(Error::SequenceError(
                "pipeline bridge sent an unexpected reply before Ready".to_string(),
            )),
            Err(_) => Err(Error::CryptoFault(
                "pipeline bridge worker exited before becoming Ready".to_string(),
            )),
        }
    }

    /// `Prepare`: build the pipeline from `description`, blocking for the
    /// synchronous reply.
    pub fn prepare(&self, description: String) -> Result<PipelineHandle> {
        self.commands
            .send(Command::Prepare { description })
            .map_err(|_| Error::SequenceError("pipeline bridge worker has exited".to_string()))?;
        match self.replies.recv() {
            Ok(Reply::Prepared { handle }) => Ok(handle),
            Ok(Reply::Failed(e)) => Err(Error::CryptoFault(e)),
            Ok(_) => Err(Error::SequenceError("unexpected pipeline bridge reply".to_string())),
            Err(_) => Err(Error::CryptoFault("pipeline bridge worker dropped".to_string())),
        }
    }

    /// `Invoke`: non-blocking from the Peer Session's perspective — the
    /// reply only confirms the buffer was accepted, not that inference
    /// finished.
    pub fn invoke(&self, tensor: Vec<u8>, user_context: u64) -> Result<()> {
        self.commands
            .send(Command::Invoke { tensor, user_context })
            .map_err(|_| Error::SequenceError("pipeline bridge worker has exited".to_string()))?;
        match self.replies.recv() {
            Ok(Reply::Invoked) => Ok(()),
            Ok(Reply::Failed(e)) => Err(Error::CryptoFault(e)),
            Ok(_) => Err(Error::SequenceError("unexpected pipeline bridge reply".to_string())),
            Err(_) => Err(Error::CryptoFault("pipeline bridge worker dropped".to_string())),
        }
    }

    /// `Stop`: halt the pipeline, joining the synchronous reply but not
    /// the worker thread itself (use [`Self::exit`] for that).
    pub fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .map_err(|_| Error::SequenceError("pipeline bridge worker has exited".to_string()))?;
        match self.replies.recv() {
            Ok(Reply::Stopped) => Ok(()),
            Err(_) => Err(Error::CryptoFault("pipeline bridge worker dropped".to_string())),
            _ => Ok(()),
        }
    }

    /// Non-blocking: has the engine produced an output for the oldest
    /// pending request? Matches the head of `pending_requests` in FIFO
    /// order (§4.9).
    pub fn poll_output(&self) -> Result<Option<PipelineOutput>> {
        self.commands
            .send(Command::PollOutput)
            .map_err(|_| Error::SequenceError("pipeline bridge worker has exited".to_string()))?;
        match self.replies.recv() {
            Ok(Reply::Output(output)) => Ok(output),
            Err(_) => Err(Error::CryptoFault("pipeline bridge worker dropped".to_string())),
            _ => Err(Error::SequenceError("unexpected pipeline bridge reply".to_string())),
        }
    }

    /// The number of requests still awaiting an output.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Pop the oldest pending request without a matching output yet —
    /// used by the owner to pair an engine-reported output with its
    /// `user_context` in strict FIFO order.
    pub fn pop_pending(&self) -> Option<PendingRequest> {
        self.pending.lock().unwrap().pop_front()
    }
}

impl Drop for PipelineBridge {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Exit);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_leg_plain_tcp() {
        let transport = Transport::Tcp { host: "edge.local".to_string(), port: 9000 };
        let description = PipelineBuilder::client_request_leg(MediaKind::Opaque, &transport).unwrap();
        assert!(description.contains("tcpclientsink host=edge.local port=9000"));
    }

    #[test]
    fn client_request_leg_media_includes_srtp_when_keyed() {
        let transport = Transport::Udp {
            host: "edge.local".to_string(),
            port: 9001,
            srtp_key: Some([7u8; 30]),
            ssrc: "42".to_string(),
        };
        let description = PipelineBuilder::client_request_leg(MediaKind::Image, &transport).unwrap();
        assert!(description.contains("jpegenc"));
        assert!(description.contains("srtpenc key=(buffer)"));
    }

    #[test]
    fn client_request_leg_media_without_key_skips_srtp() {
        let transport = Transport::Udp {
            host: "edge.local".to_string(),
            port: 9001,
            srtp_key: None,
            ssrc: "42".to_string(),
        };
        let description = PipelineBuilder::client_request_leg(MediaKind::Video, &transport).unwrap();
        assert!(description.contains("vp8enc"));
        assert!(!description.contains("srtpenc"));
    }

    #[test]
    fn server_media_pipeline_carries_peer_id_as_ssrc() {
        let description = PipelineBuilder::server_media(
            MediaKind::Image,
            9001,
            &[1u8; 30],
            "7",
            "tensorflow-lite",
            "/models/m.tflite",
            Some("true:gpu0"),
        )
        .unwrap();
        assert!(description.contains("ssrc=7"));
        assert!(description.contains("model=/models/m.tflite"));
    }

    #[test]
    fn bridge_invoke_is_delivered_in_order() {
        let builder = PipelineBridgeBuilder::build(NullPipelineEngine::default()).unwrap();
        let bridge = builder.start().unwrap();
        bridge.prepare("appsrc ! fakesink".to_string()).unwrap();

        for i in 0..5u64 {
            bridge.invoke(vec![i as u8], i).unwrap();
        }
        assert_eq!(bridge.pending_len(), 5);
        for i in 0..5u64 {
            let pending = bridge.pop_pending().unwrap();
            assert_eq!(pending.user_context, i);
        }
        assert!(bridge.pop_pending().is_none());
    }
}
