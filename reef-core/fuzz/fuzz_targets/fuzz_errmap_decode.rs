#![no_main]

use libfuzzer_sys::fuzz_target;

use reef_core::ErrorMap;

fuzz_target!(|data: &[u8]| {
    if let Ok(map) = ErrorMap::from_json(data) {
        for raw in 0u16..=0x100 {
            let _ = map.get(raw);
        }
        let _ = map.len();
    }
});
