//! Runtime PMU registry built from `/sys/bus/event_source/devices`.
//!
//! Each PMU directory advertises a kernel `type` code, optionally a `cpumask`
//! restricting where its events can be opened, a `format/` directory mapping
//! event terms to attribute bit ranges, and an `events/` directory of named
//! events expressed in those terms.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, warn};

use super::{Category, EventType};
use crate::env;

const EVENT_SOURCE_DIR: &str = "/sys/bus/event_source/devices";
const ETM_PMU_NAME: &str = "cs_etm";

/// The field of `perf_event_attr` a format term writes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FormatField {
    Config,
    Config1,
    Config2,
}

/// A format spec like `config:0-7,32-35`: the term value is scattered into
/// the listed bit ranges, low bits first.
#[derive(Clone, Debug)]
struct FormatSpec {
    field: FormatField,
    bit_ranges: Vec<(u32, u32)>,
}

impl FormatSpec {
    fn parse(spec: &str) -> Option<Self> {
        let (field, ranges) = spec.trim().split_once(':')?;
        let field = match field {
            "config" => FormatField::Config,
            "config1" => FormatField::Config1,
            "config2" => FormatField::Config2,
            _ => return None,
        };
        let mut bit_ranges = Vec::new();
        for range in ranges.split(',') {
            let (lo, hi) = match range.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
                None => {
                    let bit = range.parse().ok()?;
                    (bit, bit)
                }
            };
            if lo > hi || hi > 63 {
                return None;
            }
            bit_ranges.push((lo, hi));
        }
        Some(Self { field, bit_ranges })
    }

    fn apply(&self, mut value: u64, config: &mut PmuConfig) {
        let target = match self.field {
            FormatField::Config => &mut config.config,
            FormatField::Config1 => &mut config.config1,
            FormatField::Config2 => &mut config.config2,
        };
        for &(lo, hi) in &self.bit_ranges {
            let width = hi - lo + 1;
            let mask = if width == 64 { u64::MAX } else { (1 << width) - 1 };
            *target |= (value & mask) << lo;
            value >>= width;
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PmuConfig {
    config: u64,
    config1: u64,
    config2: u64,
}

struct Pmu {
    name: String,
    type_: u32,
    cpus: Vec<i32>,
    formats: HashMap<String, FormatSpec>,
    /// (event name, term string) pairs from `events/`.
    events: Vec<(String, String)>,
}

impl Pmu {
    fn from_dir(name: &str, dir: &Path) -> Option<Self> {
        let type_ = fs::read_to_string(dir.join("type"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let cpus = fs::read_to_string(dir.join("cpumask"))
            .ok()
            .and_then(|s| env::parse_cpu_list(&s))
            .unwrap_or_default();

        let mut formats = HashMap::new();
        if let Ok(entries) = fs::read_dir(dir.join("format")) {
            for entry in entries.flatten() {
                let term = entry.file_name().to_string_lossy().into_owned();
                let Ok(spec) = fs::read_to_string(entry.path()) else {
                    continue;
                };
                match FormatSpec::parse(&spec) {
                    Some(spec) => {
                        formats.insert(term, spec);
                    }
                    None => debug!("unparsable format spec {term} of pmu {name}: {}", spec.trim()),
                }
            }
        }

        let mut events = Vec::new();
        if let Ok(entries) = fs::read_dir(dir.join("events")) {
            for entry in entries.flatten() {
                let event_name = entry.file_name().to_string_lossy().into_owned();
                // Skip the .scale/.unit companions of metric events.
                if event_name.ends_with(".scale") || event_name.ends_with(".unit") {
                    continue;
                }
                if let Ok(terms) = fs::read_to_string(entry.path()) {
                    events.push((event_name, terms.trim().to_string()));
                }
            }
        }

        Some(Self {
            name: name.to_string(),
            type_,
            cpus,
            formats,
            events,
        })
    }

    /// Resolves an `events/` term string (`event=0x03,umask=0x01`) into
    /// attribute config words using this PMU's formats.
    fn resolve_terms(&self, terms: &str) -> Option<PmuConfig> {
        let mut config = PmuConfig::default();
        for term in terms.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let (key, value) = match term.split_once('=') {
                Some((key, value)) => (key, parse_term_value(value)?),
                None => (term, 1),
            };
            match self.formats.get(key) {
                Some(spec) => spec.apply(value, &mut config),
                None => {
                    warn!("pmu {} event term '{key}' has no format spec", self.name);
                    return None;
                }
            }
        }
        Some(config)
    }
}

fn parse_term_value(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn pmus() -> &'static [Pmu] {
    static PMUS: OnceLock<Vec<Pmu>> = OnceLock::new();
    PMUS.get_or_init(|| {
        let Ok(entries) = fs::read_dir(EVENT_SOURCE_DIR) else {
            return vec![];
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                Pmu::from_dir(&name, &entry.path())
            })
            .collect()
    })
}

/// Looks up a kernel-advertised PMU event, by `<pmu>/<event>/` path syntax or
/// by bare event name (first exporting PMU wins). The bare name `cs-etm`
/// addresses the instruction-trace device itself.
pub fn find_pmu_event_type(name: &str) -> Option<EventType> {
    if name == "cs-etm" {
        let info = etm_info()?;
        return Some(EventType {
            name: name.to_string(),
            category: Category::Etm,
            type_: info.type_,
            config: 0,
        });
    }

    let (pmu_name, event_name) = match name.split_once('/') {
        Some((pmu, rest)) => (Some(pmu), rest.strip_suffix('/')?),
        None => (None, name),
    };
    for pmu in pmus() {
        if pmu_name.is_some_and(|n| n != pmu.name) {
            continue;
        }
        for (event, terms) in &pmu.events {
            if event.as_str() == event_name {
                let config = pmu.resolve_terms(terms)?;
                return Some(EventType {
                    name: name.to_string(),
                    category: Category::Pmu,
                    type_: pmu.type_,
                    config: config.config,
                });
            }
        }
    }
    None
}

/// The cpumask of the PMU with kernel type code `type_`, empty when the PMU
/// is CPU-agnostic.
pub fn cpumask_of_type(type_: u32) -> Vec<i32> {
    pmus()
        .iter()
        .find(|p| p.type_ == type_)
        .map(|p| p.cpus.clone())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug)]
pub struct EtmInfo {
    pub type_: u32,
    /// Address-range filter pairs the device advertises; one range filter
    /// consumes two single filters.
    pub addr_filter_pairs: u32,
}

pub fn etm_info() -> Option<&'static EtmInfo> {
    static ETM: OnceLock<Option<EtmInfo>> = OnceLock::new();
    ETM.get_or_init(|| {
        let dir = Path::new(EVENT_SOURCE_DIR).join(ETM_PMU_NAME);
        let type_ = fs::read_to_string(dir.join("type")).ok()?.trim().parse().ok()?;
        let addr_filter_pairs = fs::read_to_string(dir.join("nr_addr_filters"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Some(EtmInfo {
            type_,
            addr_filter_pairs,
        })
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_spec_parsing() {
        let spec = FormatSpec::parse("config:0-7").unwrap();
        assert_eq!(spec.field, FormatField::Config);
        assert_eq!(spec.bit_ranges, vec![(0, 7)]);

        let spec = FormatSpec::parse("config1:16-23,32").unwrap();
        assert_eq!(spec.field, FormatField::Config1);
        assert_eq!(spec.bit_ranges, vec![(16, 23), (32, 32)]);

        assert!(FormatSpec::parse("bogus:0-7").is_none());
        assert!(FormatSpec::parse("config:7-0").is_none());
    }

    #[test]
    fn format_spec_scatters_bits() {
        let spec = FormatSpec::parse("config:8-15").unwrap();
        let mut config = PmuConfig::default();
        spec.apply(0xc4, &mut config);
        assert_eq!(config.config, 0xc4 << 8);

        // Split range: low term bits fill the low range first.
        let spec = FormatSpec::parse("config:0-3,16-19").unwrap();
        let mut config = PmuConfig::default();
        spec.apply(0xa5, &mut config);
        assert_eq!(config.config, 0x5 | (0xa << 16));
    }

    #[test]
    fn term_values() {
        assert_eq!(parse_term_value("0x1b"), Some(0x1b));
        assert_eq!(parse_term_value("12"), Some(12));
        assert_eq!(parse_term_value("zz"), None);
    }
}
