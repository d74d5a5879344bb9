#![no_main]

use std::io::Read;

use libfuzzer_sys::fuzz_target;
use xop_multipart::MultipartBody;

fuzz_target!(|data: &[u8]| {
    let content_type = match "multipart/related; boundary=X-BOUNDARY; start=\"<root>\"".parse() {
        Ok(content_type) => content_type,
        Err(_) => return,
    };
    let multipart = match MultipartBody::new(data, content_type) {
        Ok(multipart) => multipart,
        Err(_) => return,
    };

    // Alternate between streaming and buffering so both paths see the input.
    for (idx, part) in multipart.parts().enumerate() {
        let part = match part {
            Ok(part) => part,
            Err(_) => break,
        };
        if idx % 2 == 0 {
            if let Ok(mut reader) = part.input_stream(false) {
                let mut sink = Vec::new();
                let _ = reader.read_to_end(&mut sink);
            }
        } else {
            let _ = part.bytes();
        }
    }

    let _ = multipart.root_part();
    let _ = multipart.part_count();
});
