//! Request dispatch
//!
//! Decodes one request, applies it to the register table and produces the
//! frame to send back. Addressing is the caller's business: by the time a
//! frame gets here it has already been accepted as ours (or as discovery).

use crate::{
    error::{ErrorKind, Exception},
    frame::{Frame, FunctionCode, EXCEPTION_BIT},
    registers::{HoldingRegisters, RegisterId, REGISTER_COUNT},
};

/// Largest register count a single request may carry
pub const MAX_REGISTER_COUNT: u16 = 125;

/// What to do after handling a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send `frame` back
    Response {
        /// The reply
        frame: Frame,
        /// The request wrote the baud register. Renegotiate once `frame` is
        /// out.
        renegotiate: bool,
    },
    /// The request was refused; send `frame`, an exception response
    Exception {
        /// The exception response
        frame: Frame,
        /// Why the request was refused
        exception: Exception,
    },
    /// No reply could be built
    Error(ErrorKind),
}

enum Rejection {
    Exception(Exception),
    Error(ErrorKind),
}

impl From<Exception> for Rejection {
    fn from(value: Exception) -> Self {
        Rejection::Exception(value)
    }
}

impl From<ErrorKind> for Rejection {
    fn from(value: ErrorKind) -> Self {
        Rejection::Error(value)
    }
}

struct Reply {
    frame: Frame,
    renegotiate: bool,
}

type Handler = fn(&Frame, &mut HoldingRegisters) -> Result<Reply, Rejection>;

fn handler(function: FunctionCode) -> Handler {
    match function {
        FunctionCode::ReadHoldingRegisters => read_holding_registers,
        FunctionCode::WriteMultipleRegisters => write_multiple_registers,
    }
}

/// Handle one request
pub fn handle(request: &Frame, registers: &mut HoldingRegisters) -> Outcome {
    let result = match FunctionCode::try_from(request.function()) {
        Ok(function) => handler(function)(request, registers),
        Err(_unknown) => {
            mb_debug!("unsupported function {=u8:X}", _unknown.0);
            Err(Rejection::Exception(Exception::IllegalFunction))
        }
    };

    match result {
        Ok(Reply { frame, renegotiate }) => Outcome::Response { frame, renegotiate },
        Err(Rejection::Exception(exception)) => match exception_frame(request, exception) {
            Ok(frame) => Outcome::Exception { frame, exception },
            Err(kind) => Outcome::Error(kind),
        },
        Err(Rejection::Error(kind)) => Outcome::Error(kind),
    }
}

/// An exception response to `request`
pub fn exception_frame(request: &Frame, exception: Exception) -> Result<Frame, ErrorKind> {
    Frame::build(request.address(), request.function() | EXCEPTION_BIT)
        .byte(exception.wire())
        .finish()
}

/// A run of registers named by a request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u16,
    count: u16,
}

impl Span {
    fn parse(request: &Frame) -> Result<Self, Exception> {
        let (Some(start), Some(count)) = (request.payload_u16(0), request.payload_u16(2)) else {
            return Err(Exception::IllegalDataValue);
        };
        if count == 0 || count > MAX_REGISTER_COUNT {
            return Err(Exception::IllegalDataValue);
        }
        let last = u32::from(start) + u32::from(count) - 1;
        if last >= REGISTER_COUNT as u32 {
            return Err(Exception::IllegalDataAddress);
        }
        Ok(Self { start, count })
    }

    fn ids(self) -> impl Iterator<Item = RegisterId> {
        let first = usize::from(self.start);
        RegisterId::ALL[first..first + usize::from(self.count)]
            .iter()
            .copied()
    }

    fn contains(self, id: RegisterId) -> bool {
        self.ids().any(|i| i == id)
    }
}

fn read_holding_registers(request: &Frame, registers: &mut HoldingRegisters) -> Result<Reply, Rejection> {
    let span = Span::parse(request)?;
    // At most 2 * 8 bytes
    let mut builder =
        Frame::build(request.address(), request.function()).byte((span.count * 2) as u8);
    for id in span.ids() {
        builder = builder.word(registers.read(id));
    }
    Ok(Reply {
        frame: builder.finish()?,
        renegotiate: false,
    })
}

fn write_multiple_registers(request: &Frame, registers: &mut HoldingRegisters) -> Result<Reply, Rejection> {
    let span = Span::parse(request)?;
    if span.ids().any(RegisterId::is_read_only) {
        mb_debug!("write to read-only span {}+{}", span.start, span.count);
        return Err(Exception::IllegalFunction.into());
    }

    let payload = request.payload();
    let byte_count = usize::from(span.count) * 2;
    let data = match payload.get(4..) {
        Some([declared, data @ ..]) if usize::from(*declared) == byte_count && data.len() == byte_count => data,
        _ => return Err(Exception::IllegalDataValue.into()),
    };

    for (id, word) in span.ids().zip(data.chunks_exact(2)) {
        registers.write(id, u16::from_be_bytes([word[0], word[1]]));
    }

    let frame = Frame::build(request.address(), request.function())
        .word(span.start)
        .word(span.count)
        .finish()?;
    Ok(Reply {
        frame,
        renegotiate: span.contains(RegisterId::BaudRate),
    })
}
