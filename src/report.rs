//! The allocation report written at VM death.

use crate::config::{Config, Output, ReportFormat};
use crate::env::Jvmti;
use crate::error::Result;
use crate::recorder::{SiteKey, SiteSnapshot};
use crate::rewrite::SiteOffsets;
use crate::sys::jvmti::jvmtiError;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};

/// Names for a method, as the host spells them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Declaring class signature, `Lcom/example/Worker;`.
    pub class_signature: String,
    pub name: String,
    pub signature: String,
}

/// Resolves site keys to names. Lookups that fail leave the site unnamed
/// rather than failing the report.
pub trait Symbolizer {
    fn method(&self, key: &SiteKey) -> Option<MethodInfo>;
    fn line(&self, key: &SiteKey) -> Option<u32>;

    /// The bytecode index to report for `key`. Defaults to the recorded
    /// location.
    fn bci(&self, key: &SiteKey, _method: Option<&MethodInfo>) -> i64 {
        key.location
    }
}

/// Resolves through JVMTI. Line numbers need `can_get_line_numbers`.
///
/// Recorded locations point at the injected helper call; `offsets` turns
/// them back into the offset of the allocating instruction.
pub struct JvmtiSymbolizer {
    jvmti: Jvmti,
    line_numbers: bool,
    offsets: SiteOffsets,
}

impl JvmtiSymbolizer {
    pub fn new(jvmti: Jvmti, line_numbers: bool, offsets: SiteOffsets) -> Self {
        JvmtiSymbolizer { jvmti, line_numbers, offsets }
    }

    fn lookup(&self, key: &SiteKey) -> std::result::Result<MethodInfo, jvmtiError> {
        let method = key.method_id();
        let (name, signature, _) = self.jvmti.get_method_name(method)?;
        let class = self.jvmti.get_method_declaring_class(method)?;
        let (class_signature, _) = self.jvmti.get_class_signature(class)?;
        Ok(MethodInfo { class_signature, name, signature })
    }
}

impl Symbolizer for JvmtiSymbolizer {
    fn method(&self, key: &SiteKey) -> Option<MethodInfo> {
        self.lookup(key)
            .map_err(|code| log::debug!("cannot name method {:#x}: error {}", key.method, code.0))
            .ok()
    }

    fn line(&self, key: &SiteKey) -> Option<u32> {
        if !self.line_numbers {
            return None;
        }
        let table = self.jvmti.get_line_number_table(key.method_id()).ok()?;
        line_for(table.iter().map(|entry| (entry.start_location, entry.line_number)), key.location)
    }

    fn bci(&self, key: &SiteKey, method: Option<&MethodInfo>) -> i64 {
        original_bci(&self.offsets, key, method)
    }
}

/// Translates a recorded helper-call location through `offsets`, keeping
/// the location when the method is unknown or was not rewritten here.
pub fn original_bci(offsets: &SiteOffsets, key: &SiteKey, method: Option<&MethodInfo>) -> i64 {
    method
        .and_then(|info| {
            offsets.original_bci(
                internal_name(&info.class_signature),
                &info.name,
                &info.signature,
                key.location,
            )
        })
        .unwrap_or(key.location)
}

/// `Lcom/example/Worker;` → `com/example/Worker`.
pub fn internal_name(signature: &str) -> &str {
    signature
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
        .unwrap_or(signature)
}

/// The line of the last entry starting at or before `location`.
pub fn line_for(entries: impl IntoIterator<Item = (i64, i32)>, location: i64) -> Option<u32> {
    entries
        .into_iter()
        .filter(|&(start, _)| start <= location)
        .max_by_key(|&(start, _)| start)
        .and_then(|(_, line)| u32::try_from(line).ok())
}

/// `Lcom/example/Worker;` → `com.example.Worker`.
pub fn java_class_name(signature: &str) -> String {
    internal_name(signature).replace('/', ".")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteRow {
    pub class: String,
    pub method: String,
    pub signature: String,
    pub bci: i64,
    pub line: Option<u32>,
    pub count: u64,
    pub bytes: u64,
    pub live: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub classes_seen: u32,
    pub total_count: u64,
    pub total_bytes: u64,
    pub overflow: u64,
    pub sites: Vec<SiteRow>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportTotals {
    pub classes_seen: u32,
    pub overflow: u64,
    pub track_live: bool,
}

impl Report {
    /// Sorts sites by count then bytes, keeps the first `top` (0 = all)
    /// and names them. Totals cover every site, not just the kept ones.
    pub fn build(mut sites: Vec<SiteSnapshot>, symbolizer: &dyn Symbolizer, totals: ReportTotals, top: usize) -> Self {
        let total_count = sites.iter().map(|s| s.count).sum();
        let total_bytes = sites.iter().map(|s| s.bytes).sum();

        sites.sort_by(|a, b| b.count.cmp(&a.count).then(b.bytes.cmp(&a.bytes)));
        if top > 0 {
            sites.truncate(top);
        }

        let sites = sites
            .into_iter()
            .map(|site| {
                let method = symbolizer.method(&site.key);
                let bci = symbolizer.bci(&site.key, method.as_ref());
                let (class, method, signature) = match method {
                    Some(info) => (java_class_name(&info.class_signature), info.name, info.signature),
                    None => ("<unknown>".to_owned(), format!("{:#x}", site.key.method), String::new()),
                };
                SiteRow {
                    class,
                    method,
                    signature,
                    bci,
                    line: symbolizer.line(&site.key),
                    count: site.count,
                    bytes: site.bytes,
                    live: totals.track_live.then_some(site.live),
                }
            })
            .collect();

        Report { classes_seen: totals.classes_seen, total_count, total_bytes, overflow: totals.overflow, sites }
    }

    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "heapster: {} sites, {} allocations, {} bytes (classes seen: {}, overflow: {})",
            self.sites.len(),
            self.total_count,
            self.total_bytes,
            self.classes_seen,
            self.overflow
        )?;
        writeln!(out, "{:>8} {:>10} {:>5}  site", "count", "bytes", "live")?;
        for site in &self.sites {
            let live = site.live.map_or_else(|| "-".to_owned(), |live| live.to_string());
            write!(
                out,
                "{:>8} {:>10} {:>5}  {}.{}{} @ bci {}",
                site.count, site.bytes, live, site.class, site.method, site.signature, site.bci
            )?;
            match site.line {
                Some(line) => writeln!(out, " (line {line})")?,
                None => writeln!(out)?,
            }
        }
        Ok(())
    }

    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)?;
        writeln!(out)?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, format: ReportFormat, out: &mut W) -> Result<()> {
        match format {
            ReportFormat::Text => self.write_text(out)?,
            ReportFormat::Json => self.write_json(out)?,
        }
        out.flush()?;
        Ok(())
    }

    /// Writes to the destination named by `config`.
    pub fn emit(&self, config: &Config) -> Result<()> {
        match &config.output {
            Output::Stderr => self.write_to(config.format, &mut io::stderr().lock()),
            Output::File(path) => {
                let mut file = BufWriter::new(File::create(path)?);
                self.write_to(config.format, &mut file)?;
                log::info!("report written to {}", path.display());
                Ok(())
            }
        }
    }
}
