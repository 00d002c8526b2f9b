//! COF image packer CLI.
//!
//! Reads a component manifest (TOML), pulls in the referenced payload
//! files and writes one COF image:
//!
//!   cof-builder --manifest echo/component.toml --out build/echo.cof
//!
//! Addresses in the manifest are link addresses and may be written in hex
//! (`vaddr = 0x1000`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

use cof::{CompClass, ProvideKind, RequireKind, SegmentPurpose};
use cof_builder::ImageBuilder;
use mpc_platform::MemKind;

#[derive(Parser, Debug)]
#[command(name = "cof-builder")]
#[command(about = "Pack a component manifest and its payloads into a COF image")]
struct Args {
    /// Component manifest (TOML)
    #[arg(long)]
    manifest: PathBuf,

    /// Output image path
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ClassName {
    Component,
    Firmware,
    Singleton,
}

impl From<ClassName> for CompClass {
    fn from(c: ClassName) -> Self {
        match c {
            ClassName::Component => CompClass::Component,
            ClassName::Firmware => CompClass::Firmware,
            ClassName::Singleton => CompClass::Singleton,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum PurposeName {
    Code,
    Const,
    Data,
}

impl From<PurposeName> for SegmentPurpose {
    fn from(p: PurposeName) -> Self {
        match p {
            PurposeName::Code => SegmentPurpose::Code,
            PurposeName::Const => SegmentPurpose::Const,
            PurposeName::Data => SegmentPurpose::Data,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BankName {
    SdramCode,
    SdramData,
    EsramCode,
    EsramData,
}

impl From<BankName> for MemKind {
    fn from(b: BankName) -> Self {
        match b {
            BankName::SdramCode => MemKind::SdramCode,
            BankName::SdramData => MemKind::SdramData,
            BankName::EsramCode => MemKind::EsramCode,
            BankName::EsramData => MemKind::EsramData,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    name: String,
    class: Option<ClassName>,
    version: Option<[u8; 3]>,
    #[serde(default)]
    min_stack: u32,
    #[serde(default, rename = "segment")]
    segments: Vec<SegmentEntry>,
    #[serde(default, rename = "reloc")]
    relocs: Vec<RelocEntry>,
    #[serde(default, rename = "interface")]
    interfaces: Vec<InterfaceEntry>,
    #[serde(default, rename = "require")]
    requires: Vec<RequireEntry>,
    #[serde(default, rename = "provide")]
    provides: Vec<ProvideEntry>,
    #[serde(default, rename = "attribute")]
    attributes: Vec<AttributeEntry>,
    #[serde(default, rename = "property")]
    properties: Vec<PropertyEntry>,
    lifecycle: Option<LifecycleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegmentEntry {
    name: String,
    purpose: PurposeName,
    mem: BankName,
    vaddr: u32,
    size: u32,
    #[serde(default = "default_align")]
    align: u32,
    /// Payload file, relative to the manifest. Omitted means all-zero.
    payload: Option<PathBuf>,
}

fn default_align() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelocEntry {
    seg: u16,
    target: u16,
    offset: u32,
    #[serde(default)]
    addend: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterfaceEntry {
    #[serde(rename = "type")]
    type_name: String,
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequireEntry {
    name: String,
    /// Index into the interface table.
    interface: u32,
    #[serde(default)]
    flags: Vec<String>,
    /// Only meaningful for kinds without patch sites; otherwise the
    /// collection size is the number of site lists.
    collection: Option<u32>,
    #[serde(default)]
    sites: Vec<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProvideEntry {
    name: String,
    interface: u32,
    #[serde(default)]
    flags: Vec<String>,
    irq: Option<u32>,
    collection: Option<u32>,
    #[serde(default)]
    methods: Vec<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttributeEntry {
    name: String,
    addr: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PropertyEntry {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LifecycleEntry {
    construct: Option<u32>,
    start: Option<u32>,
    stop: Option<u32>,
    destroy: Option<u32>,
}

fn require_flags(flags: &[String]) -> Result<RequireKind> {
    let mut kind = RequireKind::empty();
    for flag in flags {
        kind |= match flag.as_str() {
            "static" => RequireKind::STATIC,
            "optional" => RequireKind::OPTIONAL,
            "virtual" => RequireKind::VIRTUAL,
            "intrinsic" => RequireKind::INTRINSIC,
            other => bail!("unknown require flag {other:?}"),
        };
    }
    Ok(kind)
}

fn provide_flags(flags: &[String]) -> Result<ProvideKind> {
    let mut kind = ProvideKind::empty();
    for flag in flags {
        kind |= match flag.as_str() {
            "virtual" => ProvideKind::VIRTUAL,
            "interrupt" => ProvideKind::INTERRUPT,
            other => bail!("unknown provide flag {other:?}"),
        };
    }
    Ok(kind)
}

fn pack(manifest: &Manifest, base_dir: &Path) -> Result<Vec<u8>> {
    let mut builder = ImageBuilder::new(&manifest.name).with_min_stack(manifest.min_stack);
    if let Some(class) = manifest.class {
        builder = builder.with_class(class.into());
    }
    if let Some([major, minor, patch]) = manifest.version {
        builder = builder.with_version(major, minor, patch);
    }

    for seg in &manifest.segments {
        let payload = match &seg.payload {
            Some(path) => {
                let full = base_dir.join(path);
                fs::read(&full).with_context(|| format!("reading payload {}", full.display()))?
            }
            None => Vec::new(),
        };
        if payload.len() as u64 > seg.size as u64 {
            bail!(
                "segment {:?}: payload is {} bytes but the segment holds {}",
                seg.name,
                payload.len(),
                seg.size
            );
        }
        builder = builder.with_segment(
            &seg.name,
            seg.purpose.into(),
            seg.mem.into(),
            seg.vaddr,
            seg.size,
            seg.align,
            &payload,
        );
    }
    for reloc in &manifest.relocs {
        builder = builder.with_reloc(reloc.seg, reloc.target, reloc.offset, reloc.addend);
    }
    for itf in &manifest.interfaces {
        let methods: Vec<&str> = itf.methods.iter().map(String::as_str).collect();
        builder = builder.with_interface(&itf.type_name, &methods);
    }
    for req in &manifest.requires {
        let kind = require_flags(&req.flags)?;
        if kind.has_patch_sites() {
            let sites: Vec<&[u32]> = req.sites.iter().map(Vec::as_slice).collect();
            builder = builder.with_require(&req.name, req.interface, kind, &sites);
        } else {
            builder = builder.with_require_abstract(
                &req.name,
                req.interface,
                kind,
                req.collection.unwrap_or(1),
            );
        }
    }
    for pro in &manifest.provides {
        let kind = provide_flags(&pro.flags)?;
        if kind.is_virtual() {
            builder = builder.with_provide_abstract(
                &pro.name,
                pro.interface,
                kind,
                pro.collection.unwrap_or(1),
            );
        } else {
            let methods: Vec<&[u32]> = pro.methods.iter().map(Vec::as_slice).collect();
            builder = builder.with_provide(&pro.name, pro.interface, kind, pro.irq, &methods);
        }
    }
    for attr in &manifest.attributes {
        builder = builder.with_attribute(&attr.name, attr.addr);
    }
    for prop in &manifest.properties {
        builder = builder.with_property(&prop.name, &prop.value);
    }
    if let Some(lc) = &manifest.lifecycle {
        if let Some(addr) = lc.construct {
            builder = builder.with_construct(addr);
        }
        if let Some(addr) = lc.start {
            builder = builder.with_start(addr);
        }
        if let Some(addr) = lc.stop {
            builder = builder.with_stop(addr);
        }
        if let Some(addr) = lc.destroy {
            builder = builder.with_destroy(addr);
        }
    }
    Ok(builder.build())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let text = fs::read_to_string(&args.manifest)
        .with_context(|| format!("reading {}", args.manifest.display()))?;
    let manifest: Manifest =
        toml::from_str(&text).with_context(|| format!("parsing {}", args.manifest.display()))?;
    let base_dir = args
        .manifest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let image = pack(&manifest, &base_dir)?;
    fs::write(&args.out, &image).with_context(|| format!("writing {}", args.out.display()))?;

    log::info!(
        "packed {:?}: {} segments, {} requires, {} provides, {} bytes",
        manifest.name,
        manifest.segments.len(),
        manifest.requires.len(),
        manifest.provides.len(),
        image.len()
    );
    log::info!("image written to {}", args.out.display());

    Ok(())
}
