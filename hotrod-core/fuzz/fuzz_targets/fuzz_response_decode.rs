#![no_main]

use libfuzzer_sys::fuzz_target;

use hotrod_core::protocol::{
    ClientIntelligence, Codec, DecodeProgress, DiscardTopology, OpCode, ProtocolVersion,
    RequestHeader,
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let version = ProtocolVersion::ALL[data[0] as usize % ProtocolVersion::ALL.len()];
    let codec = Codec::new(version);
    let mut buf = &data[1..];

    for intelligence in [
        ClientIntelligence::Basic,
        ClientIntelligence::TopologyAware,
        ClientIntelligence::HashDistributionAware,
    ] {
        let request = RequestHeader::new(OpCode::Get, "fuzz").with_intelligence(intelligence);
        let _ = codec.decode_response(buf, &request, &DiscardTopology, "fuzz:0", |codec, status, r| {
            codec.read_previous_value(status, r, request.flags)
        });
    }

    while !buf.is_empty() {
        match codec.decode_event(buf, |_| true) {
            Ok(DecodeProgress::Complete { consumed, .. }) if consumed > 0 => {
                buf = &buf[consumed..];
            }
            _ => break,
        }
    }
});
