#![no_main]

use libfuzzer_sys::fuzz_target;
use dotpatch::assembly::{decode_body, encode, CodeGenerator};

fuzz_target!(|data: &[u8]| {
    let mut generator = CodeGenerator::new();
    if let Ok(decoded) = decode_body(data, &mut generator) {
        let _ = encode(&decoded.instructions, &mut generator);
    }
});
