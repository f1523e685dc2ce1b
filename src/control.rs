// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian control file primitives.

Repository indices, `.deb` control members, and the dpkg `status` file all
consist of *paragraphs* of `Name: value` fields separated by blank lines.
See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>.

Values are stored exactly as they appeared after the `Name: ` separator
(including embedded newlines and the leading space of continuation lines),
so serializing a parsed paragraph reproduces the input bytes.
*/

use {
    crate::error::{BuildError, Result},
    futures::{AsyncBufRead, AsyncBufReadExt},
    std::io::{BufRead, Write},
};

/// A single field in a control paragraph.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Field {
    name: String,
    value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The field name, as it appeared in the input.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw value, newlines and continuation indentation included.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Iterate over the lines of the value, with leading whitespace trimmed.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|l| l.trim_start())
    }

    /// Iterate over whitespace-separated words of the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b": ")?;
        writer.write_all(self.value.as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// An ordered collection of fields terminated by a blank line.
///
/// Field names are case insensitive on read and case preserving on write.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Paragraph {
    fields: Vec<Field>,
}

impl Paragraph {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set a field, replacing any previous occurrence of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let field = Field::new(name, value);
        self.fields
            .retain(|f| !f.name.eq_ignore_ascii_case(&field.name));
        self.fields.push(field);
    }

    /// Insert a field immediately after the named field, or append if absent.
    ///
    /// Used when synthesizing dpkg `status` stanzas, where `Status:`
    /// conventionally follows `Package:`.
    pub fn insert_after(&mut self, after: &str, name: impl Into<String>, value: impl Into<String>) {
        let field = Field::new(name, value);
        self.fields
            .retain(|f| !f.name.eq_ignore_ascii_case(&field.name));

        match self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(after))
        {
            Some(pos) => self.fields.insert(pos + 1, field),
            None => self.fields.push(field),
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value())
    }

    /// The field value parsed as a `u64`.
    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name)
            .map(|v| v.trim().parse::<u64>().map_err(BuildError::ParseInt))
    }

    /// Whether the field value is the literal `yes`.
    pub fn field_bool(&self, name: &str) -> bool {
        matches!(self.field_str(name), Some("yes"))
    }

    /// Iterate fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// The named field's value, one trimmed line at a time.
    pub fn field_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_lines())
    }

    /// The named field's value, one word at a time.
    pub fn field_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_words())
    }

    /// Serialize to a writer. The final field carries a trailing newline but
    /// no paragraph separator is emitted.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }

    pub fn to_string(&self) -> String {
        let mut buf = Vec::new();
        self.write(&mut buf).expect("in-memory write");
        String::from_utf8(buf).expect("fields are UTF-8")
    }
}

/// Incremental parser fed one line at a time.
///
/// Emits a [Paragraph] whenever a blank line terminates one.
#[derive(Clone, Debug, Default)]
pub struct ParagraphParser {
    paragraph: Paragraph,
    pending: Option<String>,
}

impl ParagraphParser {
    /// Feed one line (trailing newline included or not).
    ///
    /// Returns a completed paragraph when the line terminates one.
    pub fn write_line(&mut self, line: &str) -> Result<Option<Paragraph>> {
        let is_blank = line.trim().is_empty();
        let is_continuation = (line.starts_with(' ') || line.starts_with('\t')) && !is_blank;

        if is_blank {
            if let Some(pending) = self.pending.take() {
                self.flush(pending)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        let line = line.strip_suffix('\n').unwrap_or(line);

        match (self.pending.take(), is_continuation) {
            // Continuation of the field being accumulated.
            (Some(pending), true) => {
                self.pending = Some(format!("{}\n{}", pending, line));
            }
            // A new field begins; flush the previous one.
            (Some(pending), false) => {
                self.flush(pending)?;
                self.pending = Some(line.to_string());
            }
            (None, false) => {
                self.pending = Some(line.to_string());
            }
            (None, true) => {
                return Err(BuildError::ControlParse(format!(
                    "continuation line without a field: {:?}",
                    line
                )));
            }
        }

        Ok(None)
    }

    /// Finish parsing, returning any paragraph still being accumulated.
    pub fn finish(mut self) -> Result<Option<Paragraph>> {
        if let Some(pending) = self.pending.take() {
            self.flush(pending)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush(&mut self, raw: String) -> Result<()> {
        let (name, value) = raw.split_once(':').ok_or_else(|| {
            BuildError::ControlParse(format!("field line missing colon: {:?}", raw))
        })?;

        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(BuildError::ControlParse(format!(
                "illegal field name: {:?}",
                name
            )));
        }

        self.paragraph
            .set(name.to_string(), value.trim_start().trim_end().to_string());

        Ok(())
    }
}

/// Iterator of paragraphs over a buffered reader.
pub struct ParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ParagraphParser>,
}

impl<R: BufRead> ParagraphReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ParagraphParser::default()),
        }
    }

    fn read_next(&mut self) -> Result<Option<Paragraph>> {
        let mut parser = self.parser.take().expect("parser present until EOF");

        loop {
            let mut line = String::new();

            if self.reader.read_line(&mut line)? == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ParagraphReader<R> {
    type Item = Result<Paragraph>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            return None;
        }

        match self.read_next() {
            Ok(Some(p)) => Some(Ok(p)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Asynchronous paragraph reader over an [AsyncBufRead].
pub struct AsyncParagraphReader<R> {
    reader: R,
    parser: Option<ParagraphParser>,
}

impl<R> AsyncParagraphReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ParagraphParser::default()),
        }
    }

    /// Read the next paragraph. Resolves to [None] at end of input.
    pub async fn read_paragraph(&mut self) -> Result<Option<Paragraph>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        loop {
            let mut line = String::new();

            if self.reader.read_line(&mut line).await? == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}
