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

use std::path::Path;

use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, FileSpec, FlexiLoggerError, Logger, LoggerHandle,
    Naming,
};

const DEFAULT_LOG_RETENTION: usize = 30;

/// Initializes logging for binaries embedding the engine. `spec` is the
/// fallback level filter when RUST_LOG is unset; with a file path, output
/// is rotated daily and duplicated to stderr for warnings and up.
pub fn init(spec: &str, log_file: Option<&Path>) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(spec)?.format(colored_opt_format);
    let logger = match log_file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path)?)
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(DEFAULT_LOG_RETENTION),
            )
            .append()
            .duplicate_to_stderr(flexi_logger::Duplicate::Warn),
        None => logger,
    };
    logger.start()
}
