// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::Path;

/// Exposes the board type from the `SBOOT_BOARD` envvar into
/// `cfg(target_board="...")`.
pub fn expose_target_board() {
    if let Ok(board) = env::var("SBOOT_BOARD") {
        println!("cargo:rustc-cfg=target_board=\"{}\"", board);
    }
    println!("cargo:rerun-if-env-changed=SBOOT_BOARD");
}

///
/// Pulls the board configuration for a build script. If the environment
/// variable `var` is set, its contents are the configuration; otherwise the
/// TOML file at `path` (relative to the crate being built) is. As with any
/// serde target, `T` only needs to describe the parts the caller cares
/// about.
///
pub fn config_or_file<T: DeserializeOwned>(
    var: &str,
    path: impl AsRef<Path>,
) -> Result<T> {
    // We want to emit this whether or not the env var is present, so that
    // we'll be re-run if it becomes present.
    println!("cargo:rerun-if-env-changed={}", var);

    let text = match env::var(var) {
        Ok(text) => {
            println!("--- toml for ${} ---", var);
            text
        }
        Err(_) => {
            let path = path.as_ref();
            println!("cargo:rerun-if-changed={}", path.display());
            std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?
        }
    };
    println!("{}", text);
    parse(&text)
}

/// Parses board configuration text.
pub fn parse<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}
