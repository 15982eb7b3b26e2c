/*
 * Copyright (C) 2025 The Staticpod Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::operator::k8s::store::StoreError;
use std::error::Error;
use std::fmt;

/// A store failure annotated with the startup step it interrupted.
#[derive(Debug)]
pub struct StartupError {
    step: &'static str,
    source: StoreError,
}

impl StartupError {
    pub fn new(step: &'static str, source: StoreError) -> Self {
        Self { step, source }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.source)
    }
}

impl Error for StartupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_is_prefixed_and_store_error_kept_as_source() {
        let err = StartupError::new(
            "failed to seed operator config",
            StoreError::Unavailable("store closed".to_string()),
        );
        assert_eq!(err.to_string(), "failed to seed operator config: store unavailable: store closed");
        let source = err
            .source()
            .and_then(|source| source.downcast_ref::<StoreError>())
            .expect("store error retained");
        assert!(source.is_transient());
    }
}
