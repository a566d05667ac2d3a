/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use thiserror::Error;

// Construction failures are fatal to the engine; the embedding binary is
// expected to abort on them. The packet path itself never returns errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parsing {key} value '{value}' failed")]
    InvalidConfigValue { key: &'static str, value: String },
    #[error("flow.memcap {memcap} smaller than flow hash area {hash_area}")]
    MemcapTooSmall { memcap: u64, hash_area: u64 },
    #[error("preallocating flows failed: memcap reached (memcap {memcap}, memuse {memuse})")]
    PreallocExceedsMemcap { memcap: u64, memuse: u64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
