//! Application responder
//!
//! A [`Responder`] turns requests into response producers. Every method has a
//! default that rejects the interaction, so implementors override only the
//! interactions they serve.

use crate::error::ResponderError;
use crate::payload::Payload;
use crate::producer::BoxProducer;
use bytes::Bytes;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Handler for inbound requests
///
/// Methods are called on the connection's dispatch thread and should return
/// quickly; long-running work belongs in the returned producer.
pub trait Responder: Send + Sync + 'static {
    /// Answer with at most one item
    fn request_response(&self, _payload: Payload) -> Result<BoxProducer, ResponderError> {
        Err(ResponderError::unsupported("Request-Response"))
    }

    /// Answer with a stream of items
    fn request_stream(&self, _payload: Payload) -> Result<BoxProducer, ResponderError> {
        Err(ResponderError::unsupported("Request-Stream"))
    }

    /// Answer a bi-directional channel
    ///
    /// `payload` is the request frame's payload. `inbound` yields the items the
    /// peer sends on the channel, starting with that same payload. Dropping
    /// `inbound` without attaching it tells the peer to stop sending.
    fn request_channel(&self, _payload: Payload, _inbound: BoxProducer) -> Result<BoxProducer, ResponderError> {
        Err(ResponderError::unsupported("Request-Channel"))
    }

    /// Consume a request that expects no answer
    ///
    /// Errors are logged and otherwise ignored.
    fn fire_and_forget(&self, _payload: Payload) -> Result<(), ResponderError> {
        Err(ResponderError::unsupported("Fire-and-Forget"))
    }

    /// Consume connection-level metadata
    fn metadata_push(&self, _metadata: Bytes) -> Result<(), ResponderError> {
        Err(ResponderError::unsupported("Metadata-Push"))
    }
}

impl<R: Responder + ?Sized> Responder for Arc<R> {
    fn request_response(&self, payload: Payload) -> Result<BoxProducer, ResponderError> {
        (**self).request_response(payload)
    }

    fn request_stream(&self, payload: Payload) -> Result<BoxProducer, ResponderError> {
        (**self).request_stream(payload)
    }

    fn request_channel(&self, payload: Payload, inbound: BoxProducer) -> Result<BoxProducer, ResponderError> {
        (**self).request_channel(payload, inbound)
    }

    fn fire_and_forget(&self, payload: Payload) -> Result<(), ResponderError> {
        (**self).fire_and_forget(payload)
    }

    fn metadata_push(&self, metadata: Bytes) -> Result<(), ResponderError> {
        (**self).metadata_push(metadata)
    }
}

/// Run a responder callback, turning a panic into an application error
pub(crate) fn invoke<T, F>(f: F) -> Result<T, ResponderError>
where
    F: FnOnce() -> Result<T, ResponderError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(ResponderError::application(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Responder panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::producer;

    struct Nothing;

    impl Responder for Nothing {}

    #[test]
    fn test_defaults_reject() {
        let err = Nothing.request_stream(Payload::empty()).err().unwrap();
        assert_eq!(err.code(), ErrorCode::ApplicationError);
        assert_eq!(err.message(), "Request-Stream not implemented");

        let err = Nothing
            .request_channel(Payload::empty(), producer::never())
            .err()
            .unwrap();
        assert_eq!(err.message(), "Request-Channel not implemented");

        assert!(Nothing.fire_and_forget(Payload::empty()).is_err());
        assert!(Nothing.metadata_push(Bytes::new()).is_err());
    }

    #[test]
    fn test_invoke_catches_panics() {
        let result: Result<(), ResponderError> = invoke(|| panic!("handler exploded"));
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ApplicationError);
        assert_eq!(err.message(), "handler exploded");

        let result: Result<(), ResponderError> = invoke(|| panic!("code {}", 7));
        assert_eq!(result.unwrap_err().message(), "code 7");

        let result = invoke(|| Ok(5));
        assert_eq!(result, Ok(5));
    }

    #[test]
    fn test_shared_responder() {
        struct Echo;

        impl Responder for Echo {
            fn request_response(&self, payload: Payload) -> Result<BoxProducer, ResponderError> {
                Ok(producer::once(payload))
            }
        }

        let shared = Arc::new(Echo);
        assert!(shared.request_response(Payload::from_data("x")).is_ok());
        assert!(shared.request_stream(Payload::from_data("x")).is_err());
    }
}
