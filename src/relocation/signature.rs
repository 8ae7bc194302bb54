//! Remapping of class names inside descriptors and generic signatures.
//!
//! Accepts field and method descriptors, class, method and field generic
//! signatures, and array class names (`[Lcom/lib/A;`). A string that does
//! not parse completely under that grammar is not a descriptor and is left
//! alone.

/// Rewrite every class name in `text` through `map`.
///
/// Returns `Some` only if `text` parsed completely and at least one name
/// changed.
pub(crate) fn remap<F>(text: &str, map: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut method = Parser::new(text, &map);
    if method.method_signature().is_some() && method.at_end() {
        return method.finish();
    }
    let mut plain = Parser::new(text, &map);
    if plain.type_signature().is_some() && plain.at_end() {
        return plain.finish();
    }
    None
}

struct Parser<'a, F> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    out: String,
    changed: bool,
    map: F,
}

impl<'a, F> Parser<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(text: &'a str, map: F) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            out: String::with_capacity(text.len()),
            changed: false,
            map,
        }
    }

    const fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn finish(self) -> Option<String> {
        self.changed.then_some(self.out)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> Option<()> {
        (self.peek()? == byte).then(|| {
            self.out.push(char::from(byte));
            self.pos += 1;
        })
    }

    /// `<T:..>(args)ret^throws`
    fn method_signature(&mut self) -> Option<()> {
        if self.peek()? == b'<' {
            self.type_parameters()?;
        }
        self.eat(b'(')?;
        while self.peek()? != b')' {
            self.java_type()?;
        }
        self.eat(b')')?;
        if self.peek()? == b'V' {
            self.eat(b'V')?;
        } else {
            self.java_type()?;
        }
        while self.peek() == Some(b'^') {
            self.eat(b'^')?;
            self.reference_type()?;
        }
        Some(())
    }

    /// A field descriptor, a field signature, or a class signature
    /// (optional type parameters followed by one or more class types).
    fn type_signature(&mut self) -> Option<()> {
        if self.peek()? == b'<' {
            self.type_parameters()?;
            self.reference_type()?;
        } else {
            self.java_type()?;
        }
        while self.peek().is_some() {
            self.reference_type()?;
        }
        Some(())
    }

    fn type_parameters(&mut self) -> Option<()> {
        self.eat(b'<')?;
        loop {
            self.identifier()?;
            self.eat(b':')?;
            if self.peek()? != b':' && self.peek()? != b'>' {
                self.reference_type()?;
            }
            while self.peek()? == b':' {
                self.eat(b':')?;
                self.reference_type()?;
            }
            if self.peek()? == b'>' {
                return self.eat(b'>');
            }
        }
    }

    fn java_type(&mut self) -> Option<()> {
        match self.peek()? {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
                let byte = self.peek()?;
                self.eat(byte)
            }
            _ => self.reference_type(),
        }
    }

    fn reference_type(&mut self) -> Option<()> {
        match self.peek()? {
            b'L' => self.class_type(),
            b'T' => {
                self.eat(b'T')?;
                self.identifier()?;
                self.eat(b';')
            }
            b'[' => {
                self.eat(b'[')?;
                self.java_type()
            }
            _ => None,
        }
    }

    /// `Lpkg/Outer<args>.Inner<args>;`; only the outer binary name is mapped.
    fn class_type(&mut self) -> Option<()> {
        self.pos += 1;
        self.out.push('L');
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if matches!(byte, b';' | b'<' | b'.') {
                break;
            }
            if matches!(byte, b'[' | b':' | b'>') {
                return None;
            }
            self.pos += 1;
        }
        let name = self.text.get(start..self.pos)?;
        if name.is_empty() || name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return None;
        }
        match (self.map)(name) {
            Some(mapped) if mapped != name => {
                self.out.push_str(&mapped);
                self.changed = true;
            }
            _ => self.out.push_str(name),
        }
        loop {
            match self.peek()? {
                b'<' => self.type_arguments()?,
                b'.' => {
                    self.eat(b'.')?;
                    self.identifier()?;
                }
                b';' => return self.eat(b';'),
                _ => return None,
            }
        }
    }

    fn type_arguments(&mut self) -> Option<()> {
        self.eat(b'<')?;
        loop {
            match self.peek()? {
                b'*' => self.eat(b'*')?,
                b'+' | b'-' => {
                    let byte = self.peek()?;
                    self.eat(byte)?;
                    self.reference_type()?;
                }
                b'>' => return self.eat(b'>'),
                _ => self.reference_type()?,
            }
        }
    }

    fn identifier(&mut self) -> Option<()> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if matches!(byte, b'.' | b';' | b'[' | b'/' | b'<' | b'>' | b':') {
                break;
            }
            self.pos += 1;
        }
        let identifier = self.text.get(start..self.pos)?;
        if identifier.is_empty() {
            return None;
        }
        self.out.push_str(identifier);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn relocate_lib(name: &str) -> Option<String> {
        name.strip_prefix("com/lib/").map(|rest| format!("shaded/com/lib/{rest}"))
    }

    #[rstest]
    #[case::field("Lcom/lib/A;", "Lshaded/com/lib/A;")]
    #[case::array("[[Lcom/lib/A;", "[[Lshaded/com/lib/A;")]
    #[case::method("(ILcom/lib/A;[J)Lcom/lib/B;", "(ILshaded/com/lib/A;[J)Lshaded/com/lib/B;")]
    #[case::generic_field(
        "Ljava/util/List<+Lcom/lib/A;>;",
        "Ljava/util/List<+Lshaded/com/lib/A;>;"
    )]
    #[case::class_signature(
        "<T:Lcom/lib/A;>Ljava/lang/Object;Lcom/lib/Api<TT;>;",
        "<T:Lshaded/com/lib/A;>Ljava/lang/Object;Lshaded/com/lib/Api<TT;>;"
    )]
    #[case::inner("Lcom/lib/Outer<TK;>.Inner<*>;", "Lshaded/com/lib/Outer<TK;>.Inner<*>;")]
    #[case::interface_bound(
        "<K::Lcom/lib/Key;>(TK;)V^Lcom/lib/Failure;",
        "<K::Lshaded/com/lib/Key;>(TK;)V^Lshaded/com/lib/Failure;"
    )]
    fn rewrites_class_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(remap(input, relocate_lib).as_deref(), Some(expected));
    }

    #[rstest]
    #[case::unchanged("Ljava/lang/String;")]
    #[case::method_name("onCreate")]
    #[case::attribute_name("Code")]
    #[case::source_file("A.java")]
    #[case::prose("Lcom/lib/A; is gone")]
    #[case::base_type("I")]
    fn leaves_other_strings_alone(#[case] input: &str) {
        assert_eq!(remap(input, relocate_lib), None);
    }
}
