// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use meshcore::core::codec::{decode_frame, sanitize, split_frames};

fuzz_target!(|data: &[u8]| {
    // Mirrors the read path in bootstrap/coordinator.rs and bootstrap/client.rs:
    // sanitize, lossily decode to UTF-8, split into frames, decode each.
    let sanitized = sanitize(data);
    let text = String::from_utf8_lossy(&sanitized).to_string();
    for frame in split_frames(&text) {
        let _ = decode_frame(&frame);
    }
});
