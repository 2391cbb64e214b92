// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::path::PathBuf;

fn main() {
    // Only configure linking if the turbojpeg feature is enabled
    if env::var("CARGO_FEATURE_TURBOJPEG").is_err() {
        return;
    }

    // On macOS, turbojpeg is typically installed via Homebrew and lives
    // outside the default linker search path.
    if env::var("CARGO_CFG_TARGET_OS").unwrap() == "macos" {
        let homebrew_paths = vec![
            "/opt/homebrew/opt/jpeg-turbo/lib", // Apple Silicon
            "/usr/local/opt/jpeg-turbo/lib",    // Intel Macs
        ];

        for path in homebrew_paths {
            let path_buf = PathBuf::from(path);
            if path_buf.exists() {
                println!("cargo:rustc-link-search=native={}", path);
                println!("cargo:rustc-link-lib=turbojpeg");
                return;
            }
        }
    }

    println!("cargo:rustc-link-lib=turbojpeg");
}
