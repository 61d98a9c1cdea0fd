//! pprof wire format: gzip-compressed `perftools.profiles.Profile`.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use protobuf::{Message, MessageField};

use crate::error::ProfileError;
use crate::perftools;
use crate::profile::{
    is_pseudo_path, Function, Location, Mapping, Profile, Sample, SampleType,
};

/// File name of the profile inside a run directory.
pub const PROFILE_FILE: &str = "perf.pb.gz";

#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = StringTable::default();
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(idx) = self.index.get(s) {
            return *idx;
        }
        let idx = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

fn value_type(strings: &mut StringTable, name: &str, unit: &str) -> perftools::ValueType {
    let mut vt = perftools::ValueType::new();
    vt.type_ = strings.intern(name);
    vt.unit = strings.intern(unit);
    vt
}

/// Convert to the protobuf message, building the string table as we go.
pub fn to_proto(profile: &Profile) -> perftools::Profile {
    let mut strings = StringTable::new();
    let mut out = perftools::Profile::new();

    out.sample_type = profile
        .sample_types
        .iter()
        .map(|t| value_type(&mut strings, &t.name, &t.unit))
        .collect();

    out.sample = profile
        .samples
        .iter()
        .map(|s| {
            let mut sample = perftools::Sample::new();
            sample.location_id = s.location_ids.clone();
            sample.value = s.values.clone();
            sample
        })
        .collect();

    out.mapping = profile
        .mappings
        .iter()
        .map(|m| {
            let mut mapping = perftools::Mapping::new();
            mapping.id = m.id;
            mapping.memory_start = m.start;
            mapping.memory_limit = m.limit;
            mapping.filename = strings.intern(&m.path);
            mapping.has_functions = true;
            mapping
        })
        .collect();

    out.location = profile
        .locations
        .iter()
        .map(|l| {
            let mut line = perftools::Line::new();
            line.function_id = l.function_id;
            let mut location = perftools::Location::new();
            location.id = l.id;
            location.mapping_id = l.mapping_id.unwrap_or(0);
            location.address = l.address;
            location.line = vec![line];
            location
        })
        .collect();

    out.function = profile
        .functions
        .iter()
        .map(|f| {
            let mut function = perftools::Function::new();
            function.id = f.id;
            function.name = strings.intern(&f.name);
            function.system_name = function.name;
            function
        })
        .collect();

    out.time_nanos = profile.time_nanos;
    out.period_type = MessageField::some(value_type(&mut strings, "cpu", "nanoseconds"));
    out.period = 1;
    out.string_table = strings.strings;
    out
}

fn lookup(strings: &[String], idx: i64) -> Result<String, ProfileError> {
    usize::try_from(idx)
        .ok()
        .and_then(|i| strings.get(i))
        .cloned()
        .ok_or(ProfileError::DanglingReference {
            kind: "string",
            id: idx as u64,
        })
}

pub fn from_proto(msg: &perftools::Profile) -> Result<Profile, ProfileError> {
    let strings = &msg.string_table;

    let sample_types = msg
        .sample_type
        .iter()
        .map(|t| {
            Ok(SampleType {
                name: lookup(strings, t.type_)?,
                unit: lookup(strings, t.unit)?,
            })
        })
        .collect::<Result<Vec<_>, ProfileError>>()?;

    let mappings = msg
        .mapping
        .iter()
        .map(|m| {
            let path = lookup(strings, m.filename)?;
            Ok(Mapping {
                id: m.id,
                pseudo: is_pseudo_path(&path),
                path,
                start: m.memory_start,
                limit: m.memory_limit,
            })
        })
        .collect::<Result<Vec<_>, ProfileError>>()?;

    let functions = msg
        .function
        .iter()
        .map(|f| {
            Ok(Function {
                id: f.id,
                name: lookup(strings, f.name)?,
            })
        })
        .collect::<Result<Vec<_>, ProfileError>>()?;

    let locations = msg
        .location
        .iter()
        .map(|l| {
            let function_id = l
                .line
                .first()
                .map(|line| line.function_id)
                .ok_or(ProfileError::DanglingReference {
                    kind: "function",
                    id: 0,
                })?;
            Ok(Location {
                id: l.id,
                address: l.address,
                mapping_id: (l.mapping_id != 0).then_some(l.mapping_id),
                function_id,
            })
        })
        .collect::<Result<Vec<_>, ProfileError>>()?;

    let samples = msg
        .sample
        .iter()
        .map(|s| Sample {
            location_ids: s.location_id.clone(),
            values: s.value.clone(),
        })
        .collect();

    let profile = Profile {
        sample_types,
        samples,
        locations,
        functions,
        mappings,
        time_nanos: msg.time_nanos,
    };
    profile.validate()?;
    Ok(profile)
}

/// Serialize and gzip a profile.
pub fn encode(profile: &Profile) -> Result<Vec<u8>, ProfileError> {
    let bytes = to_proto(profile)
        .write_to_bytes()
        .map_err(ProfileError::Encode)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok(encoder.finish()?)
}

pub fn decode(data: &[u8]) -> Result<Profile, ProfileError> {
    let mut bytes = Vec::new();
    GzDecoder::new(data).read_to_end(&mut bytes)?;
    let msg = perftools::Profile::parse_from_bytes(&bytes).map_err(ProfileError::Decode)?;
    from_proto(&msg)
}

pub fn write_file(profile: &Profile, path: &Path) -> Result<(), ProfileError> {
    fs::write(path, encode(profile)?)?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Profile, ProfileError> {
    decode(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MappingBounds, ProfileBuilder};

    fn sample_profile() -> Profile {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let kernel = builder.location("do_syscall_64", 0xffffffff81000010, Some("[kernel.kallsyms]"));
        let main = builder.location("main", 0x401000, Some("/srv/app"));
        let orphan = builder.location("main", 0x401100, None);
        builder.add_sample(vec![kernel, main], "cycles", 12);
        builder.add_sample(vec![orphan, main], "instructions", 40);
        builder.finish(1_700_000_000_000_000_000)
    }

    #[test]
    fn test_string_table_starts_empty_and_dedups() {
        let msg = to_proto(&sample_profile());
        assert_eq!(msg.string_table[0], "");
        let mains = msg.string_table.iter().filter(|s| *s == "main").count();
        assert_eq!(mains, 1);
    }

    #[test]
    fn test_period_and_units() {
        let msg = to_proto(&sample_profile());
        let period_type = msg.period_type.as_ref().unwrap();
        assert_eq!(msg.string_table[period_type.type_ as usize], "cpu");
        assert_eq!(msg.string_table[period_type.unit as usize], "nanoseconds");
        assert_eq!(msg.period, 1);
        for t in &msg.sample_type {
            assert_eq!(msg.string_table[t.unit as usize], "count");
        }
    }

    #[test]
    fn test_decode_preserves_samples_and_strings() {
        let profile = sample_profile();
        let decoded = decode(&encode(&profile).unwrap()).unwrap();
        assert_eq!(decoded, profile);
        assert!(decoded.mappings[0].pseudo);
        assert_eq!(decoded.location(3).unwrap().mapping_id, None);
    }

    #[test]
    fn test_output_is_gzip() {
        let data = encode(&Profile::default()).unwrap();
        assert_eq!(&data[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_decode_rejects_bad_string_index() {
        let mut msg = to_proto(&sample_profile());
        msg.function[0].name = 999;
        assert!(matches!(
            from_proto(&msg),
            Err(ProfileError::DanglingReference { kind: "string", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not a profile").is_err());
    }
}
