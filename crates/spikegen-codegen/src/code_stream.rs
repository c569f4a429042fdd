//! Indentation-aware text sink the generators and backends write into.
//!
//! Braced blocks are opened with [`CodeStream::scope`], which indents
//! everything the closure writes and closes the brace afterwards, so emitted
//! kernels nest correctly however deep the generator recursion goes.

use std::fmt;

const INDENT: &str = "    ";

/// A growing text buffer with an indentation level.
#[derive(Debug, Default)]
pub struct CodeStream {
    buf: String,
    indent: usize,
}

impl CodeStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one or more lines at the current indentation. Embedded newlines
    /// split into separate indented lines, so snippet code blocks can be
    /// passed through whole.
    pub fn line(&mut self, text: impl AsRef<str>) {
        for line in text.as_ref().split('\n') {
            if line.is_empty() {
                self.buf.push('\n');
            } else {
                for _ in 0..self.indent {
                    self.buf.push_str(INDENT);
                }
                self.buf.push_str(line);
                self.buf.push('\n');
            }
        }
    }

    /// Append text verbatim, without indentation or trailing newline. Used
    /// when composing an expression from handler output.
    pub fn raw(&mut self, text: impl AsRef<str>) {
        self.buf.push_str(text.as_ref());
    }

    /// Write an empty line.
    pub fn blank(&mut self) {
        self.buf.push('\n');
    }

    /// Open a braced scope, run `body` one level deeper, close the brace.
    pub fn scope<E>(&mut self, body: impl FnOnce(&mut Self) -> std::result::Result<(), E>) -> std::result::Result<(), E> {
        self.line("{");
        self.indent += 1;
        let result = body(self);
        self.indent -= 1;
        self.line("}");
        result
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Display for CodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_indents() {
        let mut os = CodeStream::new();
        os.line("int x = 0;");
        os.scope::<()>(|os| {
            os.line("x++;");
            Ok(())
        })
        .unwrap();
        assert_eq!(os.as_str(), "int x = 0;\n{\n    x++;\n}\n");
    }

    #[test]
    fn test_nested_scopes() {
        let mut os = CodeStream::new();
        os.scope::<()>(|os| {
            os.scope(|os| {
                os.line("deep;");
                Ok(())
            })
        })
        .unwrap();
        assert_eq!(os.as_str(), "{\n    {\n        deep;\n    }\n}\n");
    }

    #[test]
    fn test_multiline_text_indented() {
        let mut os = CodeStream::new();
        os.scope::<()>(|os| {
            os.line("a;\nb;");
            Ok(())
        })
        .unwrap();
        assert_eq!(os.as_str(), "{\n    a;\n    b;\n}\n");
    }

    #[test]
    fn test_raw_appends_verbatim() {
        let mut os = CodeStream::new();
        os.raw("x >= ");
        os.raw("1.0");
        assert_eq!(os.as_str(), "x >= 1.0");
    }
}
