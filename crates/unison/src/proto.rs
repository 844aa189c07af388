use serde::{Deserialize, Serialize};
use unison_network::{ByteBuf, encode_frame};

/// Wire payloads, dispatched on the `_pt` field.
///
/// The heartbeat's source IP is attached by the receiving side from the
/// datagram source address; it is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_pt")]
pub enum Packet {
    /// UDP multicast heartbeat advertising our listening port and
    /// timestamp.
    #[serde(rename = "an")]
    Alive {
        #[serde(rename = "_lp")]
        listen_port: u16,
        #[serde(rename = "_ts")]
        ts: u32,
    },
    /// Point-to-point TCP transfer of the shared value.
    #[serde(rename = "dt")]
    Data {
        #[serde(rename = "_dv")]
        value: String,
        #[serde(rename = "_ts")]
        ts: u32,
    },
}

impl Packet {
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Fully-framed wire form. These shapes cannot fail to serialize.
    pub fn frame(&self) -> ByteBuf {
        let json = serde_json::to_vec(self).expect("packet serializes");
        encode_frame(&json)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alive_wire_form_is_exact() {
        let pkt = Packet::Alive { listen_port: 31582, ts: 1_612_981_749 };
        let bytes = pkt.frame();
        let bytes = bytes.written();
        let json = br#"{"_pt":"an","_lp":31582,"_ts":1612981749}"#;
        assert_eq!(u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize, json.len());
        assert_eq!(&bytes[4..], json);
    }

    #[test]
    fn data_wire_form_is_exact() {
        let pkt = Packet::Data { value: "Jerico".into(), ts: 1_612_981_862 };
        let bytes = pkt.frame();
        let bytes = bytes.written();
        let json = br#"{"_pt":"dt","_dv":"Jerico","_ts":1612981862}"#;
        assert_eq!(u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize, json.len());
        assert_eq!(&bytes[4..], json);
    }

    #[test]
    fn decode_roundtrip() {
        for pkt in [
            Packet::Alive { listen_port: 9, ts: 0 },
            Packet::Data { value: "x".into(), ts: 77 },
        ] {
            let framed = pkt.frame();
            let decoded = Packet::decode(&framed.written()[4..]).unwrap();
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn unknown_packet_type_is_an_error() {
        assert!(Packet::decode(br#"{"_pt":"fn","_ts":1}"#).is_err());
        assert!(Packet::decode(b"not json").is_err());
    }
}
