#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use hotrod_core::protocol::wire::{write_vlong, WireReader};

fuzz_target!(|data: &[u8]| {
    let mut reader = WireReader::new(data);
    while let Ok(value) = reader.read_vlong() {
        let mut encoded = BytesMut::new();
        write_vlong(&mut encoded, value);
        assert!(encoded.len() <= 10);
        assert_eq!(WireReader::new(&encoded).read_vlong().ok(), Some(value));
    }

    let mut reader = WireReader::new(data);
    while reader.read_array().is_ok() {}
});
