// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct BootConfig {
    #[serde(default)]
    swap_policy: SwapPolicy,
    #[serde(default = "default_true")]
    suspend_secure_tick: bool,
    version: Version,
    flash: Flash,
    fram: Fram,
    log: Log,
    signing_key: SigningKey,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
enum SwapPolicy {
    #[default]
    Reset,
    Halt,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Flash {
    base: u32,
    bank_size: u32,
    program_granule: u32,
    sector_size: u32,
    trusted: Region,
    nsc: Region,
    untrusted: Region,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Region {
    offset: u32,
    size: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Fram {
    size: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Log {
    ring_size: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SigningKey {
    x: String,
    y: String,
}

fn coordinate(name: &str, hex: &str) -> Result<[u8; 32]> {
    if hex.len() != 64 {
        bail!("signing-key.{name} must be 64 hex digits, got {}", hex.len());
    }
    let mut out = [0u8; 32];
    for (i, b) in out.iter_mut().enumerate() {
        *b = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .with_context(|| format!("signing-key.{name}"))?;
    }
    Ok(out)
}

fn region(r: &Region) -> String {
    format!("Region {{ offset: {:#x}, size: {:#x} }}", r.offset, r.size)
}

fn main() -> Result<()> {
    build_util::expose_target_board();
    let cfg: BootConfig =
        build_util::config_or_file("SBOOT_CONFIG", "boot.toml")?;

    if !cfg.log.ring_size.is_power_of_two() || cfg.log.ring_size < 512 {
        bail!("log.ring-size must be a power of two of at least 512");
    }
    let x = coordinate("x", &cfg.signing_key.x)?;
    let y = coordinate("y", &cfg.signing_key.y)?;

    let out = PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR")?);
    let mut f = File::create(out.join("consts.rs"))?;

    writeln!(f, "// See build.rs for details")?;
    let v = &cfg.version;
    writeln!(
        f,
        "pub const COMPILED_VERSION: SchemaVersion = \
         SchemaVersion::new({}, {}, {});",
        v.major, v.minor, v.patch
    )?;

    let fl = &cfg.flash;
    writeln!(f, "pub const FLASH_LAYOUT: FlashLayout = FlashLayout {{")?;
    writeln!(f, "    base: {:#x},", fl.base)?;
    writeln!(f, "    bank_size: {:#x},", fl.bank_size)?;
    writeln!(f, "    trusted: {},", region(&fl.trusted))?;
    writeln!(f, "    nsc: {},", region(&fl.nsc))?;
    writeln!(f, "    untrusted: {},", region(&fl.untrusted))?;
    writeln!(f, "    program_granule: {},", fl.program_granule)?;
    writeln!(f, "    sector_size: {:#x},", fl.sector_size)?;
    writeln!(f, "}};")?;

    writeln!(f, "pub const FRAM_SIZE: usize = {};", cfg.fram.size)?;
    writeln!(f, "pub const LOG_RING_SIZE: usize = {};", cfg.log.ring_size)?;
    writeln!(
        f,
        "pub const SIGNING_KEY: EcdsaPublicKey = EcdsaPublicKey {{ \
         x: {x:?}, y: {y:?} }};"
    )?;
    writeln!(
        f,
        "pub const SUSPEND_SECURE_TICK: bool = {};",
        cfg.suspend_secure_tick
    )?;
    writeln!(
        f,
        "pub const SWAP_POLICY: SwapPolicy = SwapPolicy::{:?};",
        cfg.swap_policy
    )?;

    Ok(())
}
