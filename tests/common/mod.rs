//! Common test utilities for perfcap integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

/// Two `cycles` samples on the same stack, one `instructions` sample on a
/// stack through libc and the kernel.
pub const MIXED_SCRIPT: &str = "\
bench 4242 [003] 7187035.622637:         14 cycles:
\t    55d0c3a01136 hot_loop+0x16 (/work/target/release/bench)
\t    55d0c3a01200 main+0x40 (/work/target/release/bench)
\t    7f3a2b629d90 __libc_start_call_main+0x80 (/usr/lib/x86_64-linux-gnu/libc.so.6)

bench 4242 [003] 7187035.622700:         6 cycles:
\t    55d0c3a01136 hot_loop+0x16 (/work/target/release/bench)
\t    55d0c3a01200 main+0x40 (/work/target/release/bench)
\t    7f3a2b629d90 __libc_start_call_main+0x80 (/usr/lib/x86_64-linux-gnu/libc.so.6)

bench 4242 [003] 7187035.623001:        9 instructions:
\tffffffffb27c5074 do_syscall_64+0xc4 ([kernel.kallsyms])
\t    7f3a2b71e8a0 write+0x10 (/usr/lib/x86_64-linux-gnu/libc.so.6)
\t    55d0c3a01200 main+0x40 (/work/target/release/bench)

";

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("Failed to write fixture");
    path
}

/// Names of the files directly inside `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("Failed to read directory")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
