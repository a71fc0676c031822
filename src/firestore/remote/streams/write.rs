use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::model::Mutation;
use crate::firestore::remote::scheduler::StreamEvent;
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::stream::{PersistentStream, StreamNotification};
use crate::firestore::value::BytesValue;

const LOG_TARGET: &str = "firestore::write_stream";

/// Notifications raised by the [`WriteStream`].
#[derive(Debug)]
pub enum WriteStreamEvent {
    Open,
    HandshakeComplete,
    Response(WriteResponse),
    Close(Option<FirestoreError>),
}

/// The write RPC.
///
/// After opening, a handshake request must be answered before any mutations
/// are sent. Every response carries a stream token that the next request
/// echoes back.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    handshake_complete: bool,
    last_stream_token: BytesValue,
}

impl WriteStream {
    pub fn new(stream: PersistentStream, serializer: JsonProtoSerializer) -> Self {
        Self {
            stream,
            serializer,
            handshake_complete: false,
            last_stream_token: BytesValue::default(),
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn start(&mut self) {
        self.handshake_complete = false;
        self.last_stream_token = BytesValue::default();
        self.stream.start();
    }

    /// Stops the stream, telling the backend first when a handshake was done.
    pub fn stop(&mut self) {
        if self.handshake_complete && self.stream.is_open() {
            if let Err(err) = self.write_mutations(&[]) {
                log::debug!(target: LOG_TARGET, "final empty write before stop failed: {err}");
            }
        }
        self.stream.stop();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&mut self) {
        self.stream.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &BytesValue {
        &self.last_stream_token
    }

    pub fn write_handshake(&mut self) -> FirestoreResult<()> {
        if self.handshake_complete {
            return Err(failed_precondition("Handshake already completed"));
        }
        let request = self.serializer.encode_write_handshake();
        self.stream.send(request)
    }

    pub fn write_mutations(&mut self, mutations: &[Mutation]) -> FirestoreResult<()> {
        if !self.handshake_complete {
            return Err(failed_precondition(
                "Handshake must be complete before writing mutations",
            ));
        }
        let request = self
            .serializer
            .encode_write_request(&self.last_stream_token, mutations);
        self.stream.send(request)
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> Option<WriteStreamEvent> {
        match self.stream.handle_event(generation, event)? {
            StreamNotification::Opened => Some(WriteStreamEvent::Open),
            StreamNotification::Closed(error) => Some(WriteStreamEvent::Close(error)),
            StreamNotification::Message(message) => {
                let response = match self.serializer.decode_write_response(&message) {
                    Ok(response) => response,
                    Err(err) => {
                        log::error!(target: LOG_TARGET, "failed to decode write response: {err}");
                        self.stream.fail(&err);
                        return Some(WriteStreamEvent::Close(Some(err)));
                    }
                };
                self.last_stream_token = response.stream_token.clone();
                if !self.handshake_complete {
                    if !response.write_results.is_empty() {
                        log::warn!(target: LOG_TARGET, "handshake response carried write results");
                    }
                    self.handshake_complete = true;
                    return Some(WriteStreamEvent::HandshakeComplete);
                }
                self.stream.reset_backoff();
                Some(WriteStreamEvent::Response(response))
            }
        }
    }
}
