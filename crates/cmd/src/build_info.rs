// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Version strings baked in at compile time for `roost version` and the
//! clap `--version` flag.

use shadow_rs::shadow;

shadow!(build);

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

// Packagers set ROOST_RELEASE when cutting a tagged build.
const fn is_release_build() -> bool { option_env!("ROOST_RELEASE").is_some() }

const DIRTY_MARK: &str = if build::GIT_CLEAN { "" } else { "-dirty" };

/// `0.1.0` for tagged builds, `0.1.0-dev+abc1234` (plus `-dirty` for a
/// modified tree) otherwise. Builds outside git drop the commit part.
#[allow(clippy::const_is_empty)]
pub const FULL_VERSION: &str = {
    if is_release_build() {
        build::PKG_VERSION
    } else if build::SHORT_COMMIT.is_empty() {
        shadow_rs::formatcp!("{}-dev", build::PKG_VERSION)
    } else {
        shadow_rs::formatcp!(
            "{}-dev+{}{}",
            build::PKG_VERSION,
            build::SHORT_COMMIT,
            DIRTY_MARK
        )
    }
};

/// Multi-line report printed by `roost version`.
pub fn version_report() -> String {
    let mut report = format!("roost {FULL_VERSION}\n");
    if !build::COMMIT_HASH.is_empty() {
        report.push_str(&format!("commit:  {}{DIRTY_MARK}\n", build::COMMIT_HASH));
    }
    report.push_str(&format!("built:   {}\n", build::BUILD_TIME));
    report.push_str(&format!("rustc:   {}\n", build::RUST_VERSION));
    report.push_str(&format!("target:  {}\n", build::BUILD_TARGET));
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_starts_with_package_version() {
        assert!(FULL_VERSION.starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_version_report_lines() {
        let report = version_report();
        assert!(report.starts_with(&format!("roost {FULL_VERSION}\n")));
        assert!(report.contains("rustc:"));
        assert!(report.contains("target:"));
    }
}
