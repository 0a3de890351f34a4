#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use reef_core::protocol::KvFrame;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    while !buf.is_empty() {
        match KvFrame::read_from(&mut buf) {
            Ok(Some(frame)) => {
                let _ = frame.is_request();
                let _ = frame.is_response();
                let _ = frame.status();
                let _ = frame.total_body_len();
                let _ = frame.wire_size();
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
});
