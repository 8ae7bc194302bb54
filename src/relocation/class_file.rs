//! Constant-pool rewriting for compiled classes.
//!
//! Every symbolic reference in a class file goes through its constant pool,
//! so relocation only rewrites `CONSTANT_Utf8` entries and copies everything
//! after the pool byte for byte. Each Utf8 entry is classified by what refers
//! to it:
//!
//! - class entries hold internal names or array descriptors;
//! - package entries hold internal package names;
//! - string entries hold literals, rewritten only when they are exactly the
//!   name of a relocated class (dotted or internal form) or a descriptor;
//! - module entries are never touched;
//! - everything else (descriptors, generic signatures, annotation values)
//!   is rewritten when it parses as a descriptor or signature.

use super::mutf8;
use super::signature;
use super::symbols::SymbolTable;
use crate::error::{FuseError, Result};
use std::ops::Range;

/// Newest class-file major version the rewriter accepts (Java 21).
pub const MAX_SUPPORTED_MAJOR: u16 = 65;

const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];
const HEADER_LEN: usize = 10;

/// Rewrite the class at `path` through `table`.
///
/// Returns `None` when nothing in the class refers to a relocated name.
///
/// # Errors
///
/// Returns [`FuseError::UnsupportedClassVersion`] for versions newer than
/// [`MAX_SUPPORTED_MAJOR`], and [`FuseError::MalformedClass`] when the
/// constant pool is unreadable or the declared class does not match `path`.
pub fn rewrite(path: &str, bytes: &[u8], table: &SymbolTable) -> Result<Option<Vec<u8>>> {
    let class = ClassFile::parse(bytes).map_err(|e| e.into_error(path))?;
    let expected = path.strip_suffix(".class").unwrap_or(path);
    if class.this_class != expected {
        return Err(FuseError::MalformedClass {
            path: path.to_owned(),
            reason: format!("declares {} but is stored at {path}", class.this_class),
        });
    }

    let mut replacements = Vec::new();
    for (index, entry) in class.pool.iter().enumerate() {
        let Constant::Utf8(Some(text)) = &entry.constant else {
            continue;
        };
        let remapped = match class.roles.get(index).copied().unwrap_or(Role::Other) {
            Role::Module => None,
            Role::ClassName if text.starts_with('[') => {
                signature::remap(text, |name| table.map_class(name))
            }
            Role::ClassName => table.map_class(text),
            Role::PackageName => table.map_package(text),
            Role::StringLiteral => map_literal(text, table),
            Role::Other => signature::remap(text, |name| table.map_class(name)),
        };
        if let Some(mapped) = remapped.filter(|m| m != text) {
            let encoded = mutf8::encode(&mapped);
            let length = u16::try_from(encoded.len()).map_err(|_| FuseError::MalformedClass {
                path: path.to_owned(),
                reason: format!("relocated constant #{index} exceeds 65535 bytes"),
            })?;
            replacements.push((index, length, encoded));
        }
    }

    if replacements.is_empty() {
        return Ok(None);
    }
    Ok(Some(class.assemble(bytes, &replacements)))
}

/// Dotted or internal names of known classes, else descriptors.
fn map_literal(text: &str, table: &SymbolTable) -> Option<String> {
    if text.contains('.') && !text.contains('/') {
        if let Some(mapped) = table.map_known_class(&text.replace('.', "/")) {
            return Some(mapped.replace('/', "."));
        }
        return None;
    }
    table
        .map_known_class(text)
        .or_else(|| signature::remap(text, |name| table.map_class(name)))
}

/// Every Utf8 constant of a class, in pool order. Test helper.
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn utf8_constants(bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    let class = ClassFile::parse(bytes).map_err(|e| e.to_string())?;
    Ok(class
        .pool
        .into_iter()
        .filter_map(|entry| match entry.constant {
            Constant::Utf8(text) => text,
            _ => None,
        })
        .collect())
}

/// The internal name a class declares for itself. Test helper.
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn declared_name(bytes: &[u8]) -> std::result::Result<String, String> {
    ClassFile::parse(bytes)
        .map(|class| class.this_class)
        .map_err(|e| e.to_string())
}

enum ParseError {
    Malformed(String),
    Version { major: u16, minor: u16 },
}

impl ParseError {
    fn into_error(self, path: &str) -> FuseError {
        match self {
            Self::Malformed(reason) => FuseError::MalformedClass {
                path: path.to_owned(),
                reason,
            },
            Self::Version { major, minor } => FuseError::UnsupportedClassVersion {
                path: path.to_owned(),
                major,
                minor,
                max_major: MAX_SUPPORTED_MAJOR,
            },
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(reason) => f.write_str(reason),
            Self::Version { major, minor } => write!(f, "unsupported version {major}.{minor}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Role {
    Other,
    StringLiteral,
    PackageName,
    ClassName,
    Module,
}

#[derive(Debug)]
enum Constant {
    /// Decoded text; `None` when the bytes are not valid modified UTF-8.
    Utf8(Option<String>),
    Class(u16),
    String(u16),
    Module(u16),
    Package(u16),
    Other,
    /// Index 0 and the second slot of long and double constants.
    Unusable,
}

#[derive(Debug)]
struct Entry {
    range: Range<usize>,
    constant: Constant,
}

struct ClassFile {
    pool: Vec<Entry>,
    pool_end: usize,
    roles: Vec<Role>,
    this_class: String,
}

impl ClassFile {
    fn parse(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        if cursor.take(4)? != MAGIC {
            return Err(ParseError::Malformed("bad magic number".to_owned()));
        }
        let minor = cursor.u16()?;
        let major = cursor.u16()?;
        if major > MAX_SUPPORTED_MAJOR {
            return Err(ParseError::Version { major, minor });
        }
        let count = cursor.u16()?;

        let mut pool = vec![Entry {
            range: HEADER_LEN..HEADER_LEN,
            constant: Constant::Unusable,
        }];
        while pool.len() < usize::from(count) {
            let start = cursor.pos;
            let tag = cursor.u8()?;
            let constant = match tag {
                1 => {
                    let length = cursor.u16()?;
                    Constant::Utf8(mutf8::decode(cursor.take(usize::from(length))?))
                }
                3 | 4 => {
                    cursor.take(4)?;
                    Constant::Other
                }
                5 | 6 => {
                    cursor.take(8)?;
                    pool.push(Entry {
                        range: start..cursor.pos,
                        constant: Constant::Other,
                    });
                    pool.push(Entry {
                        range: cursor.pos..cursor.pos,
                        constant: Constant::Unusable,
                    });
                    continue;
                }
                7 => Constant::Class(cursor.u16()?),
                8 => Constant::String(cursor.u16()?),
                16 => {
                    cursor.u16()?;
                    Constant::Other
                }
                19 => Constant::Module(cursor.u16()?),
                20 => Constant::Package(cursor.u16()?),
                9 | 10 | 11 | 12 | 17 | 18 => {
                    cursor.take(4)?;
                    Constant::Other
                }
                15 => {
                    cursor.take(3)?;
                    Constant::Other
                }
                other => {
                    return Err(ParseError::Malformed(format!(
                        "unknown constant tag {other} at #{}",
                        pool.len()
                    )));
                }
            };
            pool.push(Entry {
                range: start..cursor.pos,
                constant,
            });
        }
        if pool.len() != usize::from(count) {
            return Err(ParseError::Malformed(
                "a wide constant overruns the pool".to_owned(),
            ));
        }
        let pool_end = cursor.pos;

        let mut roles = vec![Role::Other; pool.len()];
        for entry in &pool {
            let (target, role) = match entry.constant {
                Constant::Class(index) => (index, Role::ClassName),
                Constant::String(index) => (index, Role::StringLiteral),
                Constant::Module(index) => (index, Role::Module),
                Constant::Package(index) => (index, Role::PackageName),
                _ => continue,
            };
            let slot = roles
                .get_mut(usize::from(target))
                .ok_or_else(|| ParseError::Malformed(format!("constant index {target} out of range")))?;
            *slot = (*slot).max(role);
        }

        let _access_flags = cursor.u16()?;
        let this_index = cursor.u16()?;
        let this_class = match pool.get(usize::from(this_index)).map(|e| &e.constant) {
            Some(Constant::Class(name_index)) => match pool.get(usize::from(*name_index)).map(|e| &e.constant) {
                Some(Constant::Utf8(Some(name))) => name.clone(),
                _ => return Err(ParseError::Malformed("this_class has no valid name".to_owned())),
            },
            _ => return Err(ParseError::Malformed("this_class is not a class constant".to_owned())),
        };

        Ok(Self {
            pool,
            pool_end,
            roles,
            this_class,
        })
    }

    fn assemble(&self, bytes: &[u8], replacements: &[(usize, u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 64);
        out.extend_from_slice(bytes.get(..HEADER_LEN).unwrap_or_default());
        let mut pending = replacements.iter().peekable();
        for (index, entry) in self.pool.iter().enumerate() {
            match pending.next_if(|(i, _, _)| *i == index) {
                Some((_, length, encoded)) => {
                    out.push(1);
                    out.extend_from_slice(&length.to_be_bytes());
                    out.extend_from_slice(encoded);
                }
                None => out.extend_from_slice(bytes.get(entry.range.clone()).unwrap_or_default()),
            }
        }
        out.extend_from_slice(bytes.get(self.pool_end..).unwrap_or_default());
        out
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], ParseError> {
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.bytes.get(self.pos..end))
            .ok_or_else(|| ParseError::Malformed(format!("truncated at byte {}", self.pos)))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, ParseError> {
        Ok(self.take(1)?.first().copied().unwrap_or_default())
    }

    fn u16(&mut self) -> std::result::Result<u16, ParseError> {
        let slice = self.take(2)?;
        Ok(u16::from_be_bytes([
            slice.first().copied().unwrap_or_default(),
            slice.get(1).copied().unwrap_or_default(),
        ]))
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "tests fail loudly on broken fixtures and missing entries"
)]
mod tests {
    use super::*;
    use crate::relocation::{AccessorRule, RelocationRule, RelocationSpec};
    use crate::testing::{ClassFileBuilder, tree_with_classes};
    use rstest::{fixture, rstest};

    #[fixture]
    fn table() -> SymbolTable {
        let tree = tree_with_classes(&[
            ("app", &["com/app/Main"]),
            ("lib", &["com/lib/A", "com/lib/B"]),
        ]);
        let spec = RelocationSpec::new(
            vec![RelocationRule::new("com.lib", "shaded.com.lib").expect("rule")],
            vec![AccessorRule::new("com.lib", "com.app").expect("accessor")],
        )
        .expect("spec");
        SymbolTable::build(&spec, &tree).expect("table")
    }

    #[rstest]
    fn rewrites_structural_references(table: SymbolTable) {
        let bytes = ClassFileBuilder::new("com/app/Main")
            .class_ref("com/lib/A")
            .class_ref("[Lcom/lib/B;")
            .class_ref("com/lib/R$string")
            .field("dep", "Lcom/lib/A;")
            .signature("Ljava/util/List<Lcom/lib/B;>;")
            .string("com.lib.A")
            .string("com.lib.ACTION")
            .build();

        let rewritten = rewrite("com/app/Main.class", &bytes, &table)
            .expect("rewrite")
            .expect("changed");
        let constants = utf8_constants(&rewritten).expect("parse");

        for expected in [
            "shaded/com/lib/A",
            "[Lshaded/com/lib/B;",
            "com/app/R$string",
            "Lshaded/com/lib/A;",
            "Ljava/util/List<Lshaded/com/lib/B;>;",
            "shaded.com.lib.A",
            "com.lib.ACTION",
        ] {
            assert!(constants.iter().any(|c| c == expected), "missing {expected}: {constants:?}");
        }
        assert!(!constants.iter().any(|c| c == "com/lib/A"));
    }

    #[rstest]
    fn untouched_class_is_reported_unchanged(table: SymbolTable) {
        let bytes = ClassFileBuilder::new("com/app/Main").class_ref("java/util/List").build();
        assert_eq!(rewrite("com/app/Main.class", &bytes, &table).expect("rewrite"), None);
    }

    #[rstest]
    fn own_name_is_rewritten(table: SymbolTable) {
        let bytes = ClassFileBuilder::new("com/lib/A").build();
        let rewritten = rewrite("com/lib/A.class", &bytes, &table)
            .expect("rewrite")
            .expect("changed");
        assert_eq!(declared_name(&rewritten).as_deref(), Ok("shaded/com/lib/A"));
    }

    #[rstest]
    fn newer_versions_are_refused(table: SymbolTable) {
        let bytes = ClassFileBuilder::new("com/lib/A").version(MAX_SUPPORTED_MAJOR + 1).build();
        assert!(matches!(
            rewrite("com/lib/A.class", &bytes, &table),
            Err(FuseError::UnsupportedClassVersion { major: 66, .. })
        ));
    }

    #[rstest]
    #[case::bad_magic(b"\x00\x00\x00\x00\x00\x00\x00\x34".to_vec())]
    #[case::truncated(ClassFileBuilder::new("com/lib/A").build()[..20].to_vec())]
    fn malformed_bytes_are_refused(table: SymbolTable, #[case] bytes: Vec<u8>) {
        assert!(matches!(
            rewrite("com/lib/A.class", &bytes, &table),
            Err(FuseError::MalformedClass { .. })
        ));
    }

    #[rstest]
    fn path_must_match_declared_name(table: SymbolTable) {
        let bytes = ClassFileBuilder::new("com/lib/A").build();
        assert!(matches!(
            rewrite("com/lib/Other.class", &bytes, &table),
            Err(FuseError::MalformedClass { .. })
        ));
    }
}
