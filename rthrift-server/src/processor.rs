//! Request processing.

use rthrift_protocol::{
    ApplicationException, ApplicationExceptionKind, MessageHeader, MessageType, Protocol,
    ProtocolError, Reader, TType, Writable, Writer,
};
use std::io::{Read, Write};
use tracing::warn;

/// Handles requests for one service.
///
/// The server calls `process` once per message until the connection ends.
/// An implementation reads one request (header, arguments, message end),
/// runs it, and writes the reply unless the request was oneway. Returning
/// an error closes the connection.
pub trait Processor: Send + Sync + 'static {
    fn process<S: Read + Write>(&self, proto: &mut Protocol<S>) -> Result<(), ProtocolError>;
}

/// Writes a successful reply to `request`.
pub fn write_reply<S, T>(
    proto: &mut Protocol<S>,
    request: &MessageHeader,
    result: &T,
) -> Result<(), ProtocolError>
where
    S: Read + Write,
    T: Writable + ?Sized,
{
    let header = MessageHeader::new(request.name.clone(), MessageType::Reply, request.seq_id);
    proto.write_message_begin(&header)?;
    result.write(proto)?;
    proto.write_message_end()?;
    proto.flush()
}

/// Answers `request` with an exception message.
pub fn write_exception<S: Read + Write>(
    proto: &mut Protocol<S>,
    request: &MessageHeader,
    exception: &ApplicationException,
) -> Result<(), ProtocolError> {
    let header = MessageHeader::new(request.name.clone(), MessageType::Exception, request.seq_id);
    proto.write_message_begin(&header)?;
    exception.write(proto)?;
    proto.write_message_end()?;
    proto.flush()
}

/// Consumes the arguments of a request no handler exists for and, unless it
/// was oneway, replies with an `UnknownMethod` exception.
pub fn reject_unknown_method<S: Read + Write>(
    proto: &mut Protocol<S>,
    request: &MessageHeader,
) -> Result<(), ProtocolError> {
    proto.skip(TType::Struct)?;
    proto.read_message_end()?;
    warn!("unknown method '{}' (seq {})", request.name, request.seq_id);

    if request.kind == MessageType::Oneway {
        return Ok(());
    }
    let exception = ApplicationException::new(
        ApplicationExceptionKind::UnknownMethod,
        format!("Unknown method {}", request.name),
    );
    write_exception(proto, request, &exception)
}

/// Fails on messages a server must never receive.
pub fn expect_request(header: &MessageHeader) -> Result<(), ProtocolError> {
    if header.kind.is_request() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidData(format!(
            "unexpected {:?} message '{}' on server",
            header.kind, header.name
        )))
    }
}
