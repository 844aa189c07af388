use crate::ByteBuf;

/// Big-endian length prefix carried by every frame on the wire.
pub const LEN_PREFIX_SIZE: usize = size_of::<u32>();

/// Wraps a payload into an owned, fully-framed packet
/// (`4-byte BE length || payload`).
pub fn encode_frame(payload: &[u8]) -> ByteBuf {
    let mut frame = ByteBuf::new(payload.len() + LEN_PREFIX_SIZE);
    frame.append_u32(payload.len() as u32);
    frame.append(payload);
    frame
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    AwaitingLength,
    AwaitingBody,
}

/// Incremental frame reassembly over a connection's receive buffer.
///
/// Always in exactly one of the two states. A body is accumulated in an
/// owned buffer so a packet handed off upward never aliases the receive
/// buffer; the receive buffer may hold any prefix of the stream.
pub struct FrameDecoder {
    state: FrameState,
    body_len: usize,
    body: Option<ByteBuf>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self { state: FrameState::AwaitingLength, body_len: 0, body: None }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes unread bytes of `rdn`, returning the next complete body if
    /// one finished. Call repeatedly until `None`; the caller is responsible
    /// for compacting leftovers shorter than the length prefix.
    pub fn chase(&mut self, rdn: &mut ByteBuf) -> Option<ByteBuf> {
        loop {
            match self.state {
                FrameState::AwaitingLength => {
                    if rdn.available() < LEN_PREFIX_SIZE {
                        return None;
                    }
                    self.body_len = rdn.read_u32().expect("length prefix available") as usize;
                    self.body = Some(ByteBuf::new(self.body_len));
                    self.state = FrameState::AwaitingBody;
                }
                FrameState::AwaitingBody => {
                    let body = self.body.as_mut().expect("in-progress body in AwaitingBody");
                    let take = body.remaining().min(rdn.available());
                    rdn.read_into(take, body).expect("bounded by available");
                    if body.remaining() > 0 {
                        return None;
                    }
                    self.state = FrameState::AwaitingLength;
                    let mut done = self.body.take().expect("completed body");
                    done.set_read_mode();
                    return Some(done);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = FrameState::AwaitingLength;
        self.body_len = 0;
        self.body = None;
    }

    pub fn awaiting_body(&self) -> bool {
        self.state == FrameState::AwaitingBody
    }
}
