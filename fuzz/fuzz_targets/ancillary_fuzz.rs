#![no_main]
use fusewire::modules::ancillary::extract_descriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any control buffer must decode or be rejected, never read out of bounds.
    if let Ok(fd) = extract_descriptor(data) {
        assert!(fd >= 0);
    }
});
