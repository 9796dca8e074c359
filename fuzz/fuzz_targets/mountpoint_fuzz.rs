#![no_main]
use fusewire::modules::mount::parse_magic_fd;
use libfuzzer_sys::fuzz_target;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    if let Ok(path_str) = std::str::from_utf8(data) {
        if let Some(fd) = parse_magic_fd(Path::new(path_str)) {
            assert!(fd >= 0);
            assert!(path_str.starts_with("/dev/fd/"));
            assert!(!path_str["/dev/fd/".len()..].contains('/'));
        }
    }
});
