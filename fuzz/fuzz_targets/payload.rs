#![no_main]

use libfuzzer_sys::fuzz_target;
use dotpatch::patch::PatchSet;

fuzz_target!(|data: &[u8]| {
    if let Ok(set) = PatchSet::from_bytes(data) {
        let _ = set.to_bytes();
    }
});
