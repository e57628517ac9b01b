use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::ProtocolError;
use crate::protocol::ids;
use crate::protocol::reliability::Reliability;
use crate::session::{CloseReason, SessionId};
use crate::session_listener::SessionListener;
use crate::wrapper::batch::{decode_batch, encode_batch};
use crate::wrapper::encryption::{new_pair, Decryptor, Encryptor, KEY_LEN, TAG_LEN};
use crate::wrapper::task_queue::{Completion, SerialQueue};
use crate::wrapper::{BatchHandler, MessageSink};

/// A session is disconnected after this many payloads failed verification
pub const MAX_INTEGRITY_FAILURES: u32 = 3;

const QUEUE_CAPACITY: usize = 64;

/// Everything the encode and decode jobs of a session share
struct PipelineState {
    session_id: SessionId,
    sink: Arc<dyn MessageSink>,
    handler: Arc<dyn BatchHandler>,
    closed: AtomicBool,
    integrity_failures: AtomicU32,
    encryptor: Mutex<Option<Encryptor>>,
    decryptor: Mutex<Option<Decryptor>>,
}

impl PipelineState {
    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::SessionClosed.into());
        }
        Ok(())
    }

    async fn encode_and_send(&self, messages: Vec<Bytes>) -> anyhow::Result<()> {
        let compressed = encode_batch(&messages)?;

        let mut payload = BytesMut::with_capacity(1 + compressed.len() + TAG_LEN);
        payload.put_u8(ids::WRAPPER);
        match self.encryptor.lock().await.as_mut() {
            Some(encryptor) => payload.put_slice(&encryptor.encrypt(&compressed)),
            None => payload.put_slice(&compressed),
        }

        // the session may have closed while this was queued
        self.check_open()?;

        trace!("sending batch of {} messages as {} bytes to session {}", messages.len(), payload.len(), self.session_id);
        self.sink.send_message(self.session_id, payload.freeze(), Reliability::ReliableOrdered)
    }

    async fn decode_and_deliver(&self, payload: Bytes) -> anyhow::Result<()> {
        let Some((&header, body)) = payload.split_first() else {
            return Err(ProtocolError::malformed("empty wrapper payload"));
        };
        if header != ids::WRAPPER {
            return Err(ProtocolError::malformed(format!("unexpected payload id {:#04x}", header)));
        }

        let decrypted = match self.decryptor.lock().await.as_mut() {
            Some(decryptor) => decryptor.decrypt(body),
            None => Ok(body.to_vec()),
        };
        let compressed = match decrypted {
            Ok(compressed) => compressed,
            Err(e) => {
                if let Some(ProtocolError::IntegrityFailure) = e.downcast_ref::<ProtocolError>() {
                    self.on_integrity_failure();
                }
                return Err(e);
            }
        };

        let messages = decode_batch(&compressed)?;

        self.check_open()?;

        trace!("delivering batch of {} messages from session {}", messages.len(), self.session_id);
        self.handler.on_messages(self.session_id, messages).await;
        Ok(())
    }

    fn on_integrity_failure(&self) {
        let num_failures = self.integrity_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("payload from session {} failed verification ({} failures)", self.session_id, num_failures);

        if num_failures == MAX_INTEGRITY_FAILURES {
            info!("disconnecting session {} after {} verification failures", self.session_id, num_failures);
            if let Err(e) = self.sink.disconnect(self.session_id) {
                debug!("could not disconnect session {}: {}", self.session_id, e);
            }
        }
    }
}

/// Encodes outgoing batches and decodes incoming payloads for a single session, each
///  direction on its own [SerialQueue] so the order of batches is preserved.
///
/// After [WrapperPipeline::close], work that is still queued completes with
///  [ProtocolError::SessionClosed] instead of sending or delivering anything.
pub struct WrapperPipeline {
    state: Arc<PipelineState>,
    encode_queue: SerialQueue,
    decode_queue: SerialQueue,
}

impl WrapperPipeline {
    pub fn new(session_id: SessionId, sink: Arc<dyn MessageSink>, handler: Arc<dyn BatchHandler>) -> WrapperPipeline {
        WrapperPipeline {
            state: Arc::new(PipelineState {
                session_id,
                sink,
                handler,
                closed: AtomicBool::new(false),
                integrity_failures: AtomicU32::new(0),
                encryptor: Mutex::new(None),
                decryptor: Mutex::new(None),
            }),
            encode_queue: SerialQueue::new("wrapper-encode", QUEUE_CAPACITY),
            decode_queue: SerialQueue::new("wrapper-decode", QUEUE_CAPACITY),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.state.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    pub async fn send_batch(&self, messages: Vec<Bytes>) -> anyhow::Result<Completion<anyhow::Result<()>>> {
        self.state.check_open()?;

        let state = self.state.clone();
        self.encode_queue.enqueue(async move {
            let result = state.encode_and_send(messages).await;
            if let Err(e) = &result {
                debug!("batch for session {} was not sent: {}", state.session_id, e);
            }
            result
        }).await
    }

    /// Queues a payload received from the session for decoding and delivery to the
    ///  [BatchHandler]
    pub async fn on_payload(&self, payload: Bytes) -> anyhow::Result<Completion<anyhow::Result<()>>> {
        self.state.check_open()?;

        let state = self.state.clone();
        self.decode_queue.enqueue(async move {
            let result = state.decode_and_deliver(payload).await;
            if let Err(e) = &result {
                debug!("dropping payload from session {}: {}", state.session_id, e);
            }
            result
        }).await
    }

    /// Encrypts all batches sent after this call, and expects all payloads received after
    ///  this call to be encrypted
    pub async fn enable_encryption(&self, key: &[u8; KEY_LEN]) -> anyhow::Result<()> {
        self.state.check_open()?;
        let (encryptor, decryptor) = new_pair(key)?;

        debug!("enabling encryption for session {}", self.state.session_id);

        let state = self.state.clone();
        let _ = self.encode_queue.enqueue(async move {
            *state.encryptor.lock().await = Some(encryptor);
        }).await?;

        let state = self.state.clone();
        let _ = self.decode_queue.enqueue(async move {
            *state.decryptor.lock().await = Some(decryptor);
        }).await?;

        Ok(())
    }
}

/// Plugs the wrapper layer into the server: creates a [WrapperPipeline] per session and routes
///  the session's payloads through it to a [BatchHandler].
pub struct WrapperListener<H: BatchHandler> {
    handler: Arc<H>,
    sink: Arc<dyn MessageSink>,
    pipelines: RwLock<FxHashMap<SessionId, Arc<WrapperPipeline>>>,
}

impl <H: BatchHandler> WrapperListener<H> {
    pub fn new(handler: Arc<H>, sink: Arc<dyn MessageSink>) -> WrapperListener<H> {
        WrapperListener {
            handler,
            sink,
            pipelines: Default::default(),
        }
    }

    pub async fn pipeline(&self, session_id: SessionId) -> Option<Arc<WrapperPipeline>> {
        self.pipelines.read().await
            .get(&session_id)
            .cloned()
    }
}

#[async_trait]
impl <H: BatchHandler> SessionListener for WrapperListener<H> {
    async fn on_session_opened(&self, session_id: SessionId, peer_addr: SocketAddr) {
        let pipeline = Arc::new(WrapperPipeline::new(session_id, self.sink.clone(), self.handler.clone()));
        self.pipelines.write().await
            .insert(session_id, pipeline.clone());

        self.handler.on_session_opened(session_id, peer_addr, pipeline).await;
    }

    async fn on_message(&self, session_id: SessionId, payload: &[u8]) {
        let Some(pipeline) = self.pipeline(session_id).await else {
            debug!("payload for session {}, which has no wrapper pipeline - dropping", session_id);
            return;
        };
        if let Err(e) = pipeline.on_payload(Bytes::copy_from_slice(payload)).await {
            debug!("could not queue payload from session {}: {}", session_id, e);
        }
    }

    async fn on_session_closed(&self, session_id: SessionId, reason: CloseReason) {
        if let Some(pipeline) = self.pipelines.write().await.remove(&session_id) {
            pipeline.close();
        }
        self.handler.on_session_closed(session_id, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use mockall::predicate::eq;
    use crate::wrapper::{MockBatchHandler, MockMessageSink};

    const KEY: [u8; KEY_LEN] = [3; KEY_LEN];

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<Bytes>>,
    }

    impl MessageSink for RecordingSink {
        fn send_message(&self, session_id: SessionId, payload: Bytes, reliability: Reliability) -> anyhow::Result<()> {
            assert_eq!(session_id, SessionId(1));
            assert_eq!(reliability, Reliability::ReliableOrdered);
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn disconnect(&self, _session_id: SessionId) -> anyhow::Result<()> {
            panic!("unexpected disconnect");
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    fn messages(raw: &[&'static str]) -> Vec<Bytes> {
        raw.iter()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .collect()
    }

    /// a pipeline that only sends, recording what it sent
    fn sender() -> (WrapperPipeline, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = WrapperPipeline::new(SessionId(1), sink.clone(), Arc::new(MockBatchHandler::new()));
        (pipeline, sink)
    }

    fn receiver(handler: MockBatchHandler, sink: MockMessageSink) -> WrapperPipeline {
        WrapperPipeline::new(SessionId(2), Arc::new(sink), Arc::new(handler))
    }

    fn expect_batches(handler: &mut MockBatchHandler, batches: Vec<Vec<Bytes>>) {
        let mut seq = mockall::Sequence::new();
        for batch in batches {
            handler.expect_on_messages()
                .once()
                .in_sequence(&mut seq)
                .with(eq(SessionId(2)), eq(batch))
                .return_const(());
        }
    }

    fn is_integrity_failure(result: &anyhow::Result<()>) -> bool {
        matches!(result.as_ref().err().and_then(|e| e.downcast_ref::<ProtocolError>()), Some(ProtocolError::IntegrityFailure))
    }

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let (sender, sink) = sender();
        sender.send_batch(messages(&["a", "bb", "ccc"])).await.unwrap().await.unwrap().unwrap();
        sender.send_batch(messages(&["d"])).await.unwrap().await.unwrap().unwrap();

        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], ids::WRAPPER);

        let mut handler = MockBatchHandler::new();
        expect_batches(&mut handler, vec![messages(&["a", "bb", "ccc"]), messages(&["d"])]);
        let receiver = receiver(handler, MockMessageSink::new());
        for payload in sent {
            receiver.on_payload(payload).await.unwrap().await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let (sender, sink) = sender();
        sender.enable_encryption(&KEY).await.unwrap();
        sender.send_batch(messages(&["a", "bb", "ccc"])).await.unwrap().await.unwrap().unwrap();
        sender.send_batch(messages(&["secret"])).await.unwrap().await.unwrap().unwrap();

        let sent = sink.take();
        assert!(sent.iter().all(|p| p[0] == ids::WRAPPER));

        let mut handler = MockBatchHandler::new();
        expect_batches(&mut handler, vec![messages(&["a", "bb", "ccc"]), messages(&["secret"])]);
        let receiver = receiver(handler, MockMessageSink::new());
        receiver.enable_encryption(&KEY).await.unwrap();
        for payload in sent {
            receiver.on_payload(payload).await.unwrap().await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_tampered_payload_is_not_delivered() {
        let (sender, sink) = sender();
        sender.enable_encryption(&KEY).await.unwrap();
        sender.send_batch(messages(&["a", "bb", "ccc"])).await.unwrap().await.unwrap().unwrap();

        let mut tampered = sink.take()[0].to_vec();
        *tampered.last_mut().unwrap() ^= 0x01;

        let mut handler = MockBatchHandler::new();
        handler.expect_on_messages().never();
        let receiver = receiver(handler, MockMessageSink::new());
        receiver.enable_encryption(&KEY).await.unwrap();

        let result = receiver.on_payload(Bytes::from(tampered)).await.unwrap().await.unwrap();
        assert!(is_integrity_failure(&result));
    }

    #[tokio::test]
    async fn test_repeated_integrity_failures_disconnect() {
        let (sender, sink) = sender();
        sender.enable_encryption(&KEY).await.unwrap();
        for _ in 0..MAX_INTEGRITY_FAILURES + 1 {
            sender.send_batch(messages(&["x"])).await.unwrap().await.unwrap().unwrap();
        }

        let mut handler = MockBatchHandler::new();
        handler.expect_on_messages().never();
        let mut disconnect_sink = MockMessageSink::new();
        disconnect_sink.expect_disconnect()
            .once()
            .with(eq(SessionId(2)))
            .returning(|_| Ok(()));
        let receiver = receiver(handler, disconnect_sink);
        receiver.enable_encryption(&KEY).await.unwrap();

        for payload in sink.take() {
            let mut tampered = payload.to_vec();
            *tampered.last_mut().unwrap() ^= 0x01;
            let result = receiver.on_payload(Bytes::from(tampered)).await.unwrap().await.unwrap();
            assert!(is_integrity_failure(&result));
        }
    }

    #[tokio::test]
    async fn test_wrong_header() {
        let mut handler = MockBatchHandler::new();
        handler.expect_on_messages().never();
        let receiver = receiver(handler, MockMessageSink::new());

        let result = receiver.on_payload(Bytes::from_static(&[0x8e, 1, 2])).await.unwrap().await.unwrap();
        assert!(crate::error::is_malformed(&result.unwrap_err()));
        let result = receiver.on_payload(Bytes::new()).await.unwrap().await.unwrap();
        assert!(crate::error::is_malformed(&result.unwrap_err()));
    }

    #[tokio::test]
    async fn test_closed_pipeline() {
        let (sender, sink) = sender();
        sender.close();
        assert!(sender.is_closed());

        let err = sender.send_batch(messages(&["a"])).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ProtocolError>(), Some(&ProtocolError::SessionClosed));
        assert!(sender.on_payload(Bytes::from_static(&[ids::WRAPPER])).await.is_err());
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_close_while_queued() {
        let (sender, sink) = sender();
        let (release_sender, release_receiver) = tokio::sync::oneshot::channel::<()>();
        // block the encode queue so the batch is still queued when the pipeline closes
        let _ = sender.encode_queue.enqueue(async move { let _ = release_receiver.await; }).await.unwrap();

        let completion = sender.send_batch(messages(&["a"])).await.unwrap();
        sender.close();
        release_sender.send(()).unwrap();

        let err = completion.await.unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<ProtocolError>(), Some(&ProtocolError::SessionClosed));
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_listener_routes_through_pipeline() {
        let (sender, sink) = sender();
        sender.send_batch(messages(&["hello"])).await.unwrap().await.unwrap().unwrap();
        let payload = sink.take().remove(0);

        let peer = SocketAddr::from(([10, 0, 0, 9], 50000));
        let mut handler = MockBatchHandler::new();
        handler.expect_on_session_opened()
            .once()
            .withf(move |session_id, peer_addr, pipeline| *session_id == SessionId(2) && *peer_addr == peer && pipeline.session_id() == SessionId(2))
            .return_const(());
        handler.expect_on_messages()
            .once()
            .with(eq(SessionId(2)), eq(messages(&["hello"])))
            .return_const(());
        handler.expect_on_session_closed()
            .once()
            .with(eq(SessionId(2)), eq(CloseReason::PeerDisconnected))
            .return_const(());

        let listener = WrapperListener::new(Arc::new(handler), Arc::new(MockMessageSink::new()));
        listener.on_session_opened(SessionId(2), peer).await;
        listener.on_message(SessionId(2), &payload).await;

        let pipeline = listener.pipeline(SessionId(2)).await.unwrap();
        // wait for the decode queue to process the payload
        let _ = pipeline.decode_queue.enqueue(async {}).await.unwrap().await;

        listener.on_session_closed(SessionId(2), CloseReason::PeerDisconnected).await;
        assert!(pipeline.is_closed());
        assert!(listener.pipeline(SessionId(2)).await.is_none());

        // unknown sessions are ignored
        listener.on_message(SessionId(3), &payload).await;
    }
}
