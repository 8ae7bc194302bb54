//! Rewriting of `META-INF/*.kotlin_module` records.
//!
//! A record is a version header (a big-endian `i32` count followed by that
//! many `i32` version components, then an `i32` flags word from 1.4 on)
//! followed by a protobuf `Module` message:
//!
//! ```text
//! Module        { 1: repeated PackageParts package_parts
//!                 2: repeated PackageParts metadata_parts
//!                 3: repeated string jvm_package_name  ... }
//! PackageParts  { 1: string package_fq_name
//!                 2: repeated string short_class_name
//!                 4: repeated string multifile_facade_short_name
//!                 5: repeated string class_with_jvm_package_name_short_name
//!                 6: packed int32 class_with_jvm_package_name_package_id ... }
//! ```
//!
//! Only the strings above change; every other field is carried through
//! unchanged, in its original order. A part whose facades would land in
//! different packages cannot be expressed in the format and is refused.

use super::symbols::{SymbolTable, dotted, internal};
use crate::error::{FuseError, Result};
use std::collections::BTreeSet;

const MODULE_PACKAGE_PARTS: u64 = 1;
const MODULE_METADATA_PARTS: u64 = 2;
const MODULE_JVM_PACKAGE_NAME: u64 = 3;
const PARTS_FQ_NAME: u64 = 1;
const PARTS_SHORT_CLASS_NAME: u64 = 2;
const PARTS_MULTIFILE_FACADE: u64 = 4;
const PARTS_JVM_PACKAGE_CLASS: u64 = 5;
const PARTS_JVM_PACKAGE_ID: u64 = 6;

/// Rewrite the record at `path` through `table`.
///
/// Returns `None` when the record names no relocated package.
///
/// # Errors
///
/// Returns [`FuseError::MetadataFormatUnsupported`] for unknown versions,
/// malformed messages, and parts that relocation would split.
pub fn rewrite(path: &str, bytes: &[u8], table: &SymbolTable) -> Result<Option<Vec<u8>>> {
    let unsupported = |reason: String| FuseError::MetadataFormatUnsupported {
        path: path.to_owned(),
        reason,
    };
    let header_len = header_length(bytes).map_err(unsupported)?;
    let (header, body) = bytes.split_at(header_len);
    let mut module = decode(body).map_err(unsupported)?;

    let jvm_packages: Vec<String> = module
        .iter()
        .filter(|f| f.number == MODULE_JVM_PACKAGE_NAME)
        .filter_map(|f| f.as_str().map(str::to_owned))
        .collect();

    let mut changed = false;
    for field in &mut module {
        match field.number {
            MODULE_PACKAGE_PARTS | MODULE_METADATA_PARTS => {
                let Value::Bytes(message) = &field.value else {
                    continue;
                };
                let mut parts = decode(message).map_err(unsupported)?;
                if rewrite_parts(&mut parts, &jvm_packages, table).map_err(unsupported)? {
                    field.value = Value::Bytes(encode(&parts));
                    changed = true;
                }
            }
            MODULE_JVM_PACKAGE_NAME => {
                let Some(name) = field.as_str() else {
                    continue;
                };
                if let Some(mapped) = map_package_name(name, table) {
                    field.value = Value::Bytes(mapped.into_bytes());
                    changed = true;
                }
            }
            _ => {}
        }
    }

    if !changed {
        return Ok(None);
    }
    let mut out = header.to_vec();
    out.extend_from_slice(&encode(&module));
    Ok(Some(out))
}

/// Rewrite one `PackageParts` message; returns whether it changed.
fn rewrite_parts(
    parts: &mut [Field],
    jvm_packages: &[String],
    table: &SymbolTable,
) -> std::result::Result<bool, String> {
    let fq_name = parts
        .iter()
        .find(|f| f.number == PARTS_FQ_NAME)
        .and_then(Field::as_str)
        .ok_or_else(|| "package part without a package name".to_owned())?
        .to_owned();
    let package = internal(&fq_name);

    let mut targets = BTreeSet::new();
    if let Some(mapped) = table.map_package(&package) {
        targets.insert(mapped);
    }
    for facade in parts
        .iter()
        .filter(|f| matches!(f.number, PARTS_SHORT_CLASS_NAME | PARTS_MULTIFILE_FACADE))
        .filter_map(Field::as_str)
    {
        let class = join(&package, facade);
        match table.map_class(&class) {
            Some(mapped) => {
                let (mapped_package, simple) = split(&mapped);
                if simple != facade {
                    return Err(format!("facade {class} would be renamed to {mapped}"));
                }
                targets.insert(mapped_package.to_owned());
            }
            None => {
                targets.insert(package.clone());
            }
        }
    }
    if targets.len() > 1 {
        return Err(format!(
            "facades of package {fq_name} would be split across {}",
            targets
                .iter()
                .map(|t| dotted(t))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let jvm_ids = packed_ids(parts, PARTS_JVM_PACKAGE_ID)?;
    let jvm_classes = parts
        .iter()
        .filter(|f| f.number == PARTS_JVM_PACKAGE_CLASS)
        .filter_map(Field::as_str);
    for (short, id) in jvm_classes.zip(jvm_ids) {
        let Some(jvm_package) = usize::try_from(id).ok().and_then(|i| jvm_packages.get(i)) else {
            return Err(format!("class {short} refers to unknown JVM package #{id}"));
        };
        let class = join(&internal(jvm_package), short);
        let expected = map_package_name(jvm_package, table).map(|p| join(&internal(&p), short));
        if table.map_class(&class) != expected && table.map_class(&class).is_some() {
            return Err(format!("class {class} does not move with its JVM package"));
        }
    }

    let Some(target) = targets.into_iter().next().filter(|t| *t != package) else {
        return Ok(false);
    };
    for field in parts.iter_mut().filter(|f| f.number == PARTS_FQ_NAME) {
        field.value = Value::Bytes(dotted(&target).into_bytes());
    }
    Ok(true)
}

/// Map a JVM package name written in either dotted or internal form,
/// keeping its form.
fn map_package_name(name: &str, table: &SymbolTable) -> Option<String> {
    if name.contains('/') {
        table.map_package(name)
    } else {
        table.map_package(&internal(name)).map(|p| dotted(&p))
    }
}

fn join(package: &str, simple: &str) -> String {
    if package.is_empty() {
        simple.to_owned()
    } else {
        format!("{package}/{simple}")
    }
}

fn split(name: &str) -> (&str, &str) {
    name.rsplit_once('/').unwrap_or(("", name))
}

fn packed_ids(parts: &[Field], number: u64) -> std::result::Result<Vec<u64>, String> {
    let mut ids = Vec::new();
    for field in parts.iter().filter(|f| f.number == number) {
        match &field.value {
            Value::Varint(value) => ids.push(*value),
            Value::Bytes(packed) => {
                let mut reader = Wire { bytes: packed, pos: 0 };
                while !reader.is_empty() {
                    ids.push(reader.varint()?);
                }
            }
            _ => return Err(format!("field {number} has an unexpected wire type")),
        }
    }
    Ok(ids)
}

/// Length of the version header, validating the version.
fn header_length(bytes: &[u8]) -> std::result::Result<usize, String> {
    let mut reader = Wire { bytes, pos: 0 };
    let count = reader.i32_be()?;
    if !(1..=8).contains(&count) {
        return Err(format!("implausible version length {count}"));
    }
    let mut version = Vec::new();
    for _ in 0..count {
        version.push(reader.i32_be()?);
    }
    let major = version.first().copied().unwrap_or_default();
    let minor = version.get(1).copied().unwrap_or_default();
    if !(1..=2).contains(&major) {
        let rendered: Vec<String> = version.iter().map(ToString::to_string).collect();
        return Err(format!("metadata version {} is not supported", rendered.join(".")));
    }
    if (major, minor) >= (1, 4) {
        reader.i32_be()?;
    }
    Ok(reader.pos)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Varint(u64),
    Fixed64([u8; 8]),
    Bytes(Vec<u8>),
    Fixed32([u8; 4]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    number: u64,
    value: Value,
}

impl Field {
    fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

fn decode(bytes: &[u8]) -> std::result::Result<Vec<Field>, String> {
    let mut reader = Wire { bytes, pos: 0 };
    let mut fields = Vec::new();
    while !reader.is_empty() {
        let key = reader.varint()?;
        let number = key >> 3;
        let value = match key & 0x7 {
            0 => Value::Varint(reader.varint()?),
            1 => Value::Fixed64(reader.array::<8>()?),
            2 => {
                let length = usize::try_from(reader.varint()?).map_err(|e| e.to_string())?;
                Value::Bytes(reader.take(length)?.to_vec())
            }
            5 => Value::Fixed32(reader.array::<4>()?),
            wire_type => return Err(format!("unsupported wire type {wire_type} for field {number}")),
        };
        fields.push(Field { number, value });
    }
    Ok(fields)
}

fn encode(fields: &[Field]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        let wire_type = match field.value {
            Value::Varint(_) => 0,
            Value::Fixed64(_) => 1,
            Value::Bytes(_) => 2,
            Value::Fixed32(_) => 5,
        };
        write_varint(&mut out, (field.number << 3) | wire_type);
        match &field.value {
            Value::Varint(value) => write_varint(&mut out, *value),
            Value::Fixed64(bytes) => out.extend_from_slice(bytes),
            Value::Bytes(bytes) => {
                write_varint(&mut out, u64::try_from(bytes.len()).unwrap_or(u64::MAX));
                out.extend_from_slice(bytes);
            }
            Value::Fixed32(bytes) => out.extend_from_slice(bytes),
        }
    }
    out
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let low = u8::try_from(value & 0x7F).unwrap_or_default();
        value >>= 7;
        if value == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

struct Wire<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Wire<'a> {
    const fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], String> {
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.bytes.get(self.pos..end))
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let slice = self.take(N)?;
        <[u8; N]>::try_from(slice).map_err(|e| e.to_string())
    }

    fn i32_be(&mut self) -> std::result::Result<i32, String> {
        Ok(i32::from_be_bytes(self.array::<4>()?))
    }

    fn varint(&mut self) -> std::result::Result<u64, String> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.take(1)?.first().copied().unwrap_or_default();
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("varint longer than ten bytes".to_owned())
    }
}

/// Serialise a minimal record. Test helper.
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn encode_record(version: &[i32], packages: &[(&str, &[&str])]) -> Vec<u8> {
    let mut out = Vec::new();
    let count = i32::try_from(version.len()).unwrap_or_default();
    out.extend_from_slice(&count.to_be_bytes());
    for component in version {
        out.extend_from_slice(&component.to_be_bytes());
    }
    if version >= [1, 4].as_slice() {
        out.extend_from_slice(&0i32.to_be_bytes());
    }
    let module: Vec<Field> = packages
        .iter()
        .map(|(fq_name, facades)| {
            let mut parts = vec![Field {
                number: PARTS_FQ_NAME,
                value: Value::Bytes(fq_name.as_bytes().to_vec()),
            }];
            parts.extend(facades.iter().map(|facade| Field {
                number: PARTS_SHORT_CLASS_NAME,
                value: Value::Bytes(facade.as_bytes().to_vec()),
            }));
            Field {
                number: MODULE_PACKAGE_PARTS,
                value: Value::Bytes(encode(&parts)),
            }
        })
        .collect();
    out.extend_from_slice(&encode(&module));
    out
}

/// Package names and facades of a record. Test helper.
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn decode_packages(
    bytes: &[u8],
) -> std::result::Result<Vec<(String, Vec<String>)>, String> {
    let header_len = header_length(bytes)?;
    let module = decode(bytes.get(header_len..).unwrap_or_default())?;
    let mut packages = Vec::new();
    for field in module.iter().filter(|f| f.number == MODULE_PACKAGE_PARTS) {
        let Value::Bytes(message) = &field.value else {
            continue;
        };
        let parts = decode(message)?;
        let fq_name = parts
            .iter()
            .find(|f| f.number == PARTS_FQ_NAME)
            .and_then(Field::as_str)
            .unwrap_or_default()
            .to_owned();
        let facades = parts
            .iter()
            .filter(|f| f.number == PARTS_SHORT_CLASS_NAME)
            .filter_map(Field::as_str)
            .map(str::to_owned)
            .collect();
        packages.push((fq_name, facades));
    }
    Ok(packages)
}
