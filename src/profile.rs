//! Canonical profile model and the builder the parser fills it through.
//!
//! Every entity lives in an arena `Vec` and is identified by its 1-based
//! position, so `id == index + 1` always holds. Dedup indices map the natural
//! keys (function name, `(function, address)`, mapping path, stack) back into
//! the arenas.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ProfileError;

const PAGE_SIZE: u64 = 4096;

/// Unit attached to every event sample type.
pub const COUNT_UNIT: &str = "count";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleType {
    pub name: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Leaf first, as printed by `perf script`.
    pub location_ids: Vec<u64>,
    /// Aligned with [`Profile::sample_types`].
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: u64,
    pub address: u64,
    pub mapping_id: Option<u64>,
    pub function_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub id: u64,
    pub path: String,
    pub start: u64,
    pub limit: u64,
    /// Kernel and virtual images such as `[kernel.kallsyms]` or `[vdso]`.
    pub pseudo: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub sample_types: Vec<SampleType>,
    pub samples: Vec<Sample>,
    pub locations: Vec<Location>,
    pub functions: Vec<Function>,
    pub mappings: Vec<Mapping>,
    /// Wall clock time the profile was built, in nanoseconds since the epoch.
    pub time_nanos: i64,
}

/// How mapping address ranges are filled in when the profile is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MappingBounds {
    /// `[0, u64::MAX)` for every mapping.
    #[default]
    FullRange,
    /// Page-rounded range around the addresses actually seen in the trace.
    Observed,
}

/// Returns true for bracket-delimited pseudo images like `[kernel.kallsyms]`.
pub fn is_pseudo_path(path: &str) -> bool {
    path.len() >= 2 && path.starts_with('[') && path.ends_with(']')
}

fn arena_get<T>(items: &[T], id: u64) -> Option<&T> {
    let idx = usize::try_from(id).ok()?.checked_sub(1)?;
    items.get(idx)
}

impl Profile {
    pub fn function(&self, id: u64) -> Option<&Function> {
        arena_get(&self.functions, id)
    }

    pub fn location(&self, id: u64) -> Option<&Location> {
        arena_get(&self.locations, id)
    }

    pub fn mapping(&self, id: u64) -> Option<&Mapping> {
        arena_get(&self.mappings, id)
    }

    pub fn sample_type_index(&self, name: &str) -> Option<usize> {
        self.sample_types.iter().position(|t| t.name == name)
    }

    /// Total count recorded for one event across all samples.
    pub fn total(&self, event: &str) -> i64 {
        match self.sample_type_index(event) {
            Some(idx) => self.samples.iter().map(|s| s.values[idx]).sum(),
            None => 0,
        }
    }

    /// Paths of every mapping backed by a file on disk.
    pub fn binary_paths(&self) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|m| !m.pseudo)
            .map(|m| m.path.as_str())
            .collect()
    }

    /// Checks the structural invariants: ids match arena positions, every
    /// reference resolves and value vectors line up with the sample types.
    pub fn validate(&self) -> Result<(), ProfileError> {
        fn check_ids<T>(
            items: &[T],
            kind: &'static str,
            id_of: impl Fn(&T) -> u64,
        ) -> Result<(), ProfileError> {
            for (idx, item) in items.iter().enumerate() {
                let id = id_of(item);
                if id != idx as u64 + 1 {
                    return Err(ProfileError::DanglingReference { kind, id });
                }
            }
            Ok(())
        }
        check_ids(&self.functions, "function", |f| f.id)?;
        check_ids(&self.locations, "location", |l| l.id)?;
        check_ids(&self.mappings, "mapping", |m| m.id)?;

        for loc in &self.locations {
            if self.function(loc.function_id).is_none() {
                return Err(ProfileError::DanglingReference {
                    kind: "function",
                    id: loc.function_id,
                });
            }
            if let Some(mapping_id) = loc.mapping_id {
                if self.mapping(mapping_id).is_none() {
                    return Err(ProfileError::DanglingReference {
                        kind: "mapping",
                        id: mapping_id,
                    });
                }
            }
        }
        for sample in &self.samples {
            if sample.values.len() != self.sample_types.len() {
                return Err(ProfileError::DanglingReference {
                    kind: "sample type",
                    id: sample.values.len() as u64,
                });
            }
            for id in &sample.location_ids {
                if self.location(*id).is_none() {
                    return Err(ProfileError::DanglingReference {
                        kind: "location",
                        id: *id,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct AddressRange {
    min: u64,
    max: u64,
}

/// Append-only builder owning the arenas and their dedup indices.
#[derive(Debug, Default)]
pub struct ProfileBuilder {
    profile: Profile,
    bounds: MappingBounds,
    functions: HashMap<String, u64>,
    locations: HashMap<(String, u64), u64>,
    mappings: HashMap<String, u64>,
    ranges: HashMap<u64, AddressRange>,
    events: HashMap<String, usize>,
    stacks: HashMap<Vec<u64>, usize>,
}

impl ProfileBuilder {
    pub fn new(bounds: MappingBounds) -> Self {
        ProfileBuilder {
            bounds,
            ..Default::default()
        }
    }

    pub fn function(&mut self, name: &str) -> u64 {
        if let Some(id) = self.functions.get(name) {
            return *id;
        }
        let id = self.profile.functions.len() as u64 + 1;
        self.profile.functions.push(Function {
            id,
            name: name.to_string(),
        });
        self.functions.insert(name.to_string(), id);
        id
    }

    pub fn mapping(&mut self, path: &str) -> u64 {
        if let Some(id) = self.mappings.get(path) {
            return *id;
        }
        let id = self.profile.mappings.len() as u64 + 1;
        self.profile.mappings.push(Mapping {
            id,
            path: path.to_string(),
            start: 0,
            limit: u64::MAX,
            pseudo: is_pseudo_path(path),
        });
        self.mappings.insert(path.to_string(), id);
        id
    }

    /// Get or create the location for `function` at `address`. The mapping
    /// is attached the first time the location is seen. With observed bounds
    /// an unknown (zero) address gets no mapping, since no observed range
    /// would contain it.
    pub fn location(&mut self, function: &str, address: u64, mapping_path: Option<&str>) -> u64 {
        let mapping_path =
            mapping_path.filter(|_| address != 0 || self.bounds == MappingBounds::FullRange);
        let mapping_id = mapping_path.map(|path| self.mapping(path));
        if let Some(mapping_id) = mapping_id {
            self.track_address(mapping_id, address);
        }

        let key = (function.to_string(), address);
        if let Some(id) = self.locations.get(&key) {
            return *id;
        }
        let function_id = self.function(function);
        let id = self.profile.locations.len() as u64 + 1;
        self.profile.locations.push(Location {
            id,
            address,
            mapping_id,
            function_id,
        });
        self.locations.insert(key, id);
        id
    }

    fn track_address(&mut self, mapping_id: u64, address: u64) {
        if address == 0 {
            return;
        }
        self.ranges
            .entry(mapping_id)
            .and_modify(|r| {
                r.min = r.min.min(address);
                r.max = r.max.max(address);
            })
            .or_insert(AddressRange {
                min: address,
                max: address,
            });
    }

    fn event_index(&mut self, event: &str) -> usize {
        if let Some(idx) = self.events.get(event) {
            return *idx;
        }
        let idx = self.profile.sample_types.len();
        self.profile.sample_types.push(SampleType {
            name: event.to_string(),
            unit: COUNT_UNIT.to_string(),
        });
        for sample in &mut self.profile.samples {
            sample.values.push(0);
        }
        self.events.insert(event.to_string(), idx);
        idx
    }

    /// Adds `count` of `event` to the sample for `stack`, creating it if the
    /// exact location sequence hasn't been seen. Returns false when the
    /// sample was dropped for being empty.
    pub fn add_sample(&mut self, stack: Vec<u64>, event: &str, count: i64) -> bool {
        if stack.is_empty() || count == 0 {
            return false;
        }
        let event_idx = self.event_index(event);
        if let Some(sample_idx) = self.stacks.get(&stack) {
            self.profile.samples[*sample_idx].values[event_idx] += count;
            return true;
        }
        let mut values = vec![0; self.profile.sample_types.len()];
        values[event_idx] = count;
        self.stacks.insert(stack.clone(), self.profile.samples.len());
        self.profile.samples.push(Sample {
            location_ids: stack,
            values,
        });
        true
    }

    pub fn finish(mut self, time_nanos: i64) -> Profile {
        if self.bounds == MappingBounds::Observed {
            for mapping in &mut self.profile.mappings {
                if let Some(range) = self.ranges.get(&mapping.id) {
                    mapping.start = range.min / PAGE_SIZE * PAGE_SIZE;
                    mapping.limit = range.max.saturating_add(PAGE_SIZE) / PAGE_SIZE * PAGE_SIZE;
                    if mapping.limit <= range.max {
                        mapping.limit = u64::MAX;
                    }
                }
            }
        }
        self.profile.time_nanos = time_nanos;
        self.profile
    }
}

/// Basename of a mapping path, or the whole path when it has no file name.
pub fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(builder: &mut ProfileBuilder, frames: &[(&str, u64, &str)]) -> Vec<u64> {
        frames
            .iter()
            .map(|(func, addr, path)| builder.location(func, *addr, Some(path)))
            .collect()
    }

    #[test]
    fn test_ids_follow_arena_order() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let a = builder.location("main", 0x1000, Some("/bin/app"));
        let b = builder.location("work", 0x2000, Some("/bin/app"));
        let again = builder.location("main", 0x1000, Some("/bin/app"));
        assert_eq!((a, b, again), (1, 2, 1));

        let profile = builder.finish(0);
        assert_eq!(profile.functions.len(), 2);
        assert_eq!(profile.mappings.len(), 1);
        assert_eq!(profile.location(2).map(|l| l.function_id), Some(2));
        profile.validate().unwrap();
    }

    #[test]
    fn test_same_function_different_address() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let a = builder.location("loop", 0x10, Some("/bin/app"));
        let b = builder.location("loop", 0x20, Some("/bin/app"));
        assert_ne!(a, b);
        let profile = builder.finish(0);
        assert_eq!(profile.functions.len(), 1);
        assert_eq!(profile.locations.len(), 2);
    }

    #[test]
    fn test_new_event_pads_existing_samples() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let a = stack(&mut builder, &[("a", 1, "/bin/app")]);
        let b = stack(&mut builder, &[("b", 2, "/bin/app")]);
        assert!(builder.add_sample(a, "e1", 10));
        assert!(builder.add_sample(b, "e2", 5));
        let profile = builder.finish(0);

        let names: Vec<_> = profile.sample_types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["e1", "e2"]);
        assert_eq!(profile.samples[0].values, [10, 0]);
        assert_eq!(profile.samples[1].values, [0, 5]);
    }

    #[test]
    fn test_identical_stacks_merge() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        for count in [3, 4] {
            let s = stack(&mut builder, &[("leaf", 1, "/bin/app"), ("main", 2, "/bin/app")]);
            builder.add_sample(s, "cycles", count);
        }
        let profile = builder.finish(0);
        assert_eq!(profile.samples.len(), 1);
        assert_eq!(profile.samples[0].values, [7]);
    }

    #[test]
    fn test_empty_and_zero_samples_dropped() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let s = stack(&mut builder, &[("leaf", 1, "/bin/app")]);
        assert!(!builder.add_sample(Vec::new(), "cycles", 3));
        assert!(!builder.add_sample(s, "cycles", 0));
        let profile = builder.finish(0);
        assert!(profile.samples.is_empty());
        assert!(profile.sample_types.is_empty());
    }

    #[test]
    fn test_pseudo_mappings_flagged() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        builder.location("do_syscall_64", 0xffffffff81000000, Some("[kernel.kallsyms]"));
        builder.location("main", 0x401000, Some("/bin/app"));
        let profile = builder.finish(0);
        assert!(profile.mappings[0].pseudo);
        assert!(!profile.mappings[1].pseudo);
        assert_eq!(profile.binary_paths(), ["/bin/app"]);
    }

    #[test]
    fn test_default_bounds_cover_address_space() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        builder.location("main", 0x401234, Some("/bin/app"));
        let profile = builder.finish(0);
        assert_eq!((profile.mappings[0].start, profile.mappings[0].limit), (0, u64::MAX));
    }

    #[test]
    fn test_observed_bounds_page_rounded() {
        let mut builder = ProfileBuilder::new(MappingBounds::Observed);
        builder.location("main", 0x401234, Some("/bin/app"));
        builder.location("work", 0x402fff, Some("/bin/app"));
        builder.location("top", u64::MAX - 1, Some("[vdso]"));
        let profile = builder.finish(0);
        assert_eq!(profile.mappings[0].start, 0x401000);
        assert_eq!(profile.mappings[0].limit, 0x403000);
        assert_eq!(profile.mappings[1].limit, u64::MAX);
    }

    #[test]
    fn test_observed_bounds_contain_every_location() {
        let mut builder = ProfileBuilder::new(MappingBounds::Observed);
        builder.location("main", 0x401234, Some("/bin/app"));
        let unknown = builder.location("lost", 0, Some("/bin/app"));
        let profile = builder.finish(0);
        assert_eq!(profile.locations[unknown as usize - 1].mapping_id, None);
        for location in &profile.locations {
            if let Some(id) = location.mapping_id {
                let mapping = profile.mapping(id).unwrap();
                assert!(mapping.start <= location.address && location.address < mapping.limit);
            }
        }
        profile.validate().unwrap();

        // Full range keeps the mapping, 0 is inside it.
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let id = builder.location("lost", 0, Some("/bin/app"));
        assert_eq!(builder.finish(0).locations[id as usize - 1].mapping_id, Some(1));
    }

    #[test]
    fn test_validate_rejects_short_values() {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        let s = stack(&mut builder, &[("a", 1, "/bin/app")]);
        builder.add_sample(s, "cycles", 1);
        let mut profile = builder.finish(0);
        profile.samples[0].values.clear();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/tmp/build/myapp"), "myapp");
        assert_eq!(basename("myapp"), "myapp");
    }
}
