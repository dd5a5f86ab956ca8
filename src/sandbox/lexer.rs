use super::{Budget, SandboxError};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    /// Byte offset into the source.
    pub pos: usize,
}

const PUNCT: &[char] = &['(', ')', '{', '}', '[', ']', ',', ':', ';', '.', '=', '!', '-', '+'];

pub fn tokenize(src: &str, budget: &Budget) -> Result<Vec<Spanned>, SandboxError> {
    let mut lexer = Lexer {
        src,
        chars: src.char_indices().peekable(),
    };
    let mut out = Vec::new();
    loop {
        if out.len() % 1024 == 0 {
            budget.check_deadline()?;
        }
        let spanned = lexer.next_token()?;
        let done = spanned.token == Token::Eof;
        out.push(spanned);
        if done {
            return Ok(out);
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next().map(|(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map(|&(i, _)| i).unwrap_or(self.src.len())
    }

    fn skip_trivia(&mut self) -> Result<(), SandboxError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.bump() {
                        if matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}') {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let start = self.offset();
                    self.bump();
                    self.bump();
                    let mut prev = '\0';
                    loop {
                        match self.bump() {
                            Some('/') if prev == '*' => break,
                            Some(c) => prev = c,
                            None => return Err(SandboxError::syntax(start, "unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, SandboxError> {
        self.skip_trivia()?;
        let pos = self.offset();
        let token = match self.peek() {
            None => Token::Eof,
            Some(c) if c == '"' || c == '\'' => Token::Str(self.string(pos)?),
            Some(c) if c.is_ascii_digit() => Token::Num(self.number(pos)?),
            Some('.') if self.peek_second().is_some_and(|c| c.is_ascii_digit()) => {
                Token::Num(self.number(pos)?)
            }
            Some(c) if is_ident_start(c) => Token::Ident(self.ident()),
            Some('=') if matches!(self.peek_second(), Some('=') | Some('>')) => {
                return Err(SandboxError::Unsupported(format!(
                    "operator at byte {}",
                    pos
                )));
            }
            Some(c) if PUNCT.contains(&c) => {
                self.bump();
                Token::Punct(c)
            }
            Some('`') => return Err(SandboxError::Unsupported("template literal".into())),
            Some('/') => {
                return Err(SandboxError::Unsupported(format!(
                    "regular expression or division at byte {}",
                    pos
                )))
            }
            Some(c) => return Err(SandboxError::syntax(pos, format!("unexpected character {:?}", c))),
        };
        Ok(Spanned { token, pos })
    }

    fn ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    fn number(&mut self, pos: usize) -> Result<f64, SandboxError> {
        if self.peek() == Some('0') && matches!(self.peek_second(), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek().filter(|c| c.is_ascii_hexdigit()) {
                digits.push(c);
                self.bump();
            }
            let value = u64::from_str_radix(&digits, 16)
                .map_err(|_| SandboxError::syntax(pos, "bad hex literal"))?;
            return self.finish_number(pos, value as f64);
        }

        let mut text = String::new();
        self.digits_into(&mut text);
        if self.peek() == Some('.') {
            text.push('.');
            self.bump();
            self.digits_into(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            text.push('e');
            self.bump();
            if let Some(sign) = self.peek().filter(|c| *c == '+' || *c == '-') {
                text.push(sign);
                self.bump();
            }
            self.digits_into(&mut text);
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| SandboxError::syntax(pos, format!("bad number {:?}", text)))?;
        self.finish_number(pos, value)
    }

    fn digits_into(&mut self, text: &mut String) {
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            text.push(c);
            self.bump();
        }
    }

    fn finish_number(&mut self, pos: usize, value: f64) -> Result<f64, SandboxError> {
        match self.peek() {
            Some(c) if is_ident_continue(c) => {
                Err(SandboxError::syntax(pos, "identifier directly after number"))
            }
            _ => Ok(value),
        }
    }

    fn string(&mut self, pos: usize) -> Result<String, SandboxError> {
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();
        let mut pending_high: Option<u16> = None;
        loop {
            let c = self
                .bump()
                .ok_or_else(|| SandboxError::syntax(pos, "unterminated string"))?;
            if c != '\\' {
                flush_surrogate(&mut out, &mut pending_high);
                match c {
                    '\n' | '\r' => return Err(SandboxError::syntax(pos, "newline in string")),
                    c if c == quote => return Ok(out),
                    c => out.push(c),
                }
                continue;
            }

            let esc = self
                .bump()
                .ok_or_else(|| SandboxError::syntax(pos, "unterminated string"))?;
            if esc == 'u' {
                let unit = self.unicode_escape(pos)?;
                push_code_unit(&mut out, &mut pending_high, unit);
                continue;
            }
            flush_surrogate(&mut out, &mut pending_high);
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'v' => out.push('\u{b}'),
                '0' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => out.push('\0'),
                '0'..='9' => {
                    return Err(SandboxError::Unsupported("octal escape in string".into()))
                }
                'x' => {
                    let hex = self.hex_digits(pos, 2)?;
                    out.push(char::from_u32(hex).unwrap_or('\u{fffd}'));
                }
                '\r' => {
                    if self.peek() == Some('\n') {
                        self.bump();
                    }
                }
                '\n' | '\u{2028}' | '\u{2029}' => {}
                other => out.push(other),
            }
        }
    }

    /// Returns a UTF-16 code unit, or a full code point above the BMP for `\u{...}`.
    fn unicode_escape(&mut self, pos: usize) -> Result<u32, SandboxError> {
        if self.peek() == Some('{') {
            self.bump();
            let mut value: u32 = 0;
            let mut digits = 0;
            loop {
                match self.bump() {
                    Some('}') if digits > 0 => break,
                    Some(c) if c.is_ascii_hexdigit() && value <= 0x10ffff => {
                        value = value * 16 + c.to_digit(16).unwrap_or(0);
                        digits += 1;
                    }
                    _ => return Err(SandboxError::syntax(pos, "bad \\u{...} escape")),
                }
            }
            if value > 0x10ffff {
                return Err(SandboxError::syntax(pos, "code point out of range"));
            }
            return Ok(value);
        }
        self.hex_digits(pos, 4)
    }

    fn hex_digits(&mut self, pos: usize, count: usize) -> Result<u32, SandboxError> {
        let mut value = 0;
        for _ in 0..count {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| SandboxError::syntax(pos, "bad hex escape"))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }
}

fn push_code_unit(out: &mut String, pending_high: &mut Option<u16>, unit: u32) {
    if unit > 0xffff {
        flush_surrogate(out, pending_high);
        out.push(char::from_u32(unit).unwrap_or('\u{fffd}'));
        return;
    }
    let unit = unit as u16;
    match (*pending_high, unit) {
        (Some(high), 0xdc00..=0xdfff) => {
            *pending_high = None;
            let decoded = char::decode_utf16([high, unit])
                .next()
                .and_then(|r| r.ok())
                .unwrap_or('\u{fffd}');
            out.push(decoded);
        }
        (_, 0xd800..=0xdbff) => {
            flush_surrogate(out, pending_high);
            *pending_high = Some(unit);
        }
        (_, 0xdc00..=0xdfff) => {
            flush_surrogate(out, pending_high);
            out.push('\u{fffd}');
        }
        _ => {
            flush_surrogate(out, pending_high);
            out.push(char::from_u32(unit as u32).unwrap_or('\u{fffd}'));
        }
    }
}

fn flush_surrogate(out: &mut String, pending_high: &mut Option<u16>) {
    if pending_high.take().is_some() {
        out.push('\u{fffd}');
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}
