//! Parsing and resolution of the dirty-image-objects input: a
//! newline-delimited list of objects known to be dirtied at runtime, each
//! named by a class descriptor, an optional reference path, and an optional
//! sort key:
//!
//! ```text
//! <class_descriptor>[.<field_name>:<field_type>]* [<sort_key_u32>]
//! ```
//!
//! A purely numeric field name denotes an array index. Malformed lines are
//! logged and skipped.

use crate::mirror::{Array, Class, Object, ObjectArray};
use crate::runtime::Runtime;
use crate::util::ObjectReference;
use log::warn;
use regex::Regex;
use std::collections::HashMap;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathSegment {
    pub field_name: String,
    pub field_type: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirtyEntry {
    pub descriptor: String,
    pub path: Vec<PathSegment>,
    pub sort_key: u32,
}

/// Parse the dirty-objects input, skipping malformed lines with a warning.
pub fn parse_dirty_object_lines(input: &str) -> Vec<DirtyEntry> {
    // `<descriptor>` then zero or more `.name:type` segments.
    let line_re = Regex::new(r"^(?P<spec>\S+)(?:\s+(?P<key>\d+))?$").unwrap();
    let segment_re = Regex::new(r"^\.(?P<name>[^.:\s]+):(?P<type>[^.\s]+)$").unwrap();

    let mut entries = Vec::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(captures) = line_re.captures(line) else {
            warn!("malformed dirty-object line: {:?}", line);
            continue;
        };
        let spec = &captures["spec"];
        let sort_key = match captures.name("key") {
            Some(m) => match m.as_str().parse::<u32>() {
                Ok(key) => key,
                Err(_) => {
                    warn!("malformed dirty-object sort key: {:?}", line);
                    continue;
                }
            },
            None => 0,
        };

        // The descriptor runs up to the first `.` that starts a segment.
        let (descriptor, rest) = match spec.find(";.") {
            Some(i) => (&spec[..i + 1], &spec[i + 1..]),
            None => (spec, ""),
        };
        if !(descriptor.starts_with('L') && descriptor.ends_with(';'))
            && !descriptor.starts_with('[')
        {
            warn!("malformed dirty-object descriptor: {:?}", line);
            continue;
        }

        let mut path = Vec::new();
        let mut ok = true;
        if !rest.is_empty() {
            for raw in split_segments(rest) {
                match segment_re.captures(&raw) {
                    Some(seg) => path.push(PathSegment {
                        field_name: seg["name"].to_string(),
                        field_type: seg["type"].to_string(),
                    }),
                    None => {
                        warn!("malformed dirty-object path segment {:?}: {:?}", raw, line);
                        ok = false;
                        break;
                    }
                }
            }
        }
        if !ok {
            continue;
        }
        entries.push(DirtyEntry {
            descriptor: descriptor.to_string(),
            path,
            sort_key,
        });
    }
    entries
}

/// Split `.a:LX;.b:I` into `.a:LX;` and `.b:I`. Reference type descriptors
/// contain no dots, so a `.` always opens a new segment.
fn split_segments(rest: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    for c in rest.chars() {
        if c == '.' && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Resolve each entry against the live runtime, walking its reference path.
/// Entries whose class or path cannot be resolved are skipped with a
/// warning. Returns the matched objects with their sort keys.
pub fn match_dirty_objects(
    runtime: &Runtime,
    entries: &[DirtyEntry],
) -> HashMap<ObjectReference, u32> {
    let mut matched = HashMap::new();
    for entry in entries {
        let Some(class) = runtime.class_linker.find_class(&entry.descriptor) else {
            warn!("dirty-object class not found: {}", entry.descriptor);
            continue;
        };
        let mut current = class;
        let mut ok = true;
        for segment in &entry.path {
            match walk_segment(runtime, current, segment) {
                Some(next) if !next.is_null() => current = next,
                _ => {
                    warn!(
                        "dirty-object path {}.{} did not resolve",
                        entry.descriptor, segment.field_name
                    );
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            matched.insert(current, entry.sort_key);
        }
    }
    matched
}

fn walk_segment(
    runtime: &Runtime,
    current: ObjectReference,
    segment: &PathSegment,
) -> Option<ObjectReference> {
    // Numeric names index into arrays.
    if let Ok(index) = segment.field_name.parse::<usize>() {
        let array = Array::from_obj(current);
        if index >= array.length() {
            return None;
        }
        return Some(runtime.heap.resolve(ObjectArray::element(current, index)));
    }

    let class_obj = runtime.heap.resolve(Object::from_obj(current).klass());
    let is_class = Class::from_obj(class_obj).is_class_class();
    if is_class {
        // A class object: look for a static field first.
        if let Some(desc) = runtime.class_linker.field(current, &segment.field_name) {
            if desc.is_static {
                return Some(runtime.ref_at(current, desc.offset));
            }
        }
    }
    let desc = runtime.class_linker.instance_field(class_obj, &segment.field_name, |c| {
        runtime.super_of(c)
    })?;
    if !desc.is_reference() {
        return None;
    }
    Some(runtime.ref_at(current, desc.offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_descriptor_and_key() {
        let entries = parse_dirty_object_lines("LApp; 100\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].descriptor, "LApp;");
        assert!(entries[0].path.is_empty());
        assert_eq!(entries[0].sort_key, 100);
    }

    #[test]
    fn parses_field_paths() {
        let entries = parse_dirty_object_lines("LApp;.field:LObj; 50\nLApp;.arr:[I.3:I\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].path,
            vec![PathSegment {
                field_name: "field".to_string(),
                field_type: "LObj;".to_string()
            }]
        );
        assert_eq!(entries[0].sort_key, 50);
        assert_eq!(entries[1].path.len(), 2);
        assert_eq!(entries[1].path[1].field_name, "3");
        assert_eq!(entries[1].sort_key, 0);
    }

    #[test]
    fn skips_malformed_lines() {
        let entries = parse_dirty_object_lines("not-a-descriptor\nLOk; 1\nLBad;.x 2\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].descriptor, "LOk;");
    }

    #[test]
    fn skips_comments_and_blanks() {
        let entries = parse_dirty_object_lines("# comment\n\nLApp;\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sort_key, 0);
    }
}
