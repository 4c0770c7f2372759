// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dump the box tree of HEIF files.

use std::process::ExitCode;

use heif_reader::HeifContext;

fn main() -> ExitCode {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: dump_boxes <file.heic>...");
        return ExitCode::FAILURE;
    }

    let mut failed = false;
    for path in &paths {
        println!("Boxes in {path}:");
        match HeifContext::from_file(path) {
            Ok(context) => print!("{}", context.debug_dump_boxes()),
            Err(err) => {
                eprintln!("{path}: {err}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
