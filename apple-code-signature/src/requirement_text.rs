// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Parsing of the human readable code requirement language.

This turns text like `identifier "com.example.app" and anchor apple generic`
into [CodeRequirements]. The accepted syntax is a superset of what the
[std::fmt::Display] implementations in [crate::code_requirement] emit, so
rendered requirements can be parsed back.

Operator precedence from tightest to loosest is `!`, `and`, `or`. Multiple
requirements may be separated with `;`.
*/

use {
    crate::{
        code_requirement::{
            CodeRequirementExpression, CodeRequirementMatchExpression, CodeRequirementValue,
            CodeRequirements,
        },
        error::CodeSignError,
    },
    std::borrow::Cow,
};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Hash(Vec<u8>),
    Bracket(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Tilde,
    Lt,
    Gt,
    Le,
    Ge,
    Semicolon,
}

fn syntax_error(offset: usize, message: impl ToString) -> CodeSignError {
    CodeSignError::RequirementSyntax {
        offset,
        message: message.to_string(),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*' | '/' | '$' | '+')
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, CodeSignError> {
    let mut tokens = vec![];
    let mut chars = text.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                // Block comment.
                chars.next();
                let mut prev = ' ';
                loop {
                    match chars.next() {
                        Some((_, '/')) if prev == '*' => break,
                        Some((_, c)) => prev = c,
                        None => return Err(syntax_error(offset, "unterminated comment")),
                    }
                }
                continue;
            }
            '#' => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            ';' => Token::Semicolon,
            '~' => Token::Tilde,
            '!' => Token::Not,
            '=' => Token::Eq,
            '&' if matches!(chars.peek(), Some((_, '&'))) => {
                chars.next();
                Token::And
            }
            '|' if matches!(chars.peek(), Some((_, '|'))) => {
                chars.next();
                Token::Or
            }
            '<' | '>' => {
                let or_equal = matches!(chars.peek(), Some((_, '=')));
                if or_equal {
                    chars.next();
                }
                match (c, or_equal) {
                    ('<', false) => Token::Lt,
                    ('<', true) => Token::Le,
                    (_, false) => Token::Gt,
                    (_, true) => Token::Ge,
                }
            }
            '"' => Token::Str(read_quoted(&mut chars, offset)?),
            '[' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, ']')) => break,
                        Some((_, c)) => s.push(c),
                        None => return Err(syntax_error(offset, "unterminated '['")),
                    }
                }
                Token::Bracket(s.trim().to_string())
            }
            'H' if matches!(chars.peek(), Some((_, '"'))) => {
                chars.next();
                let s = read_quoted(&mut chars, offset)?;
                Token::Hash(
                    hex::decode(&s).map_err(|e| syntax_error(offset, format!("bad hash: {}", e)))?,
                )
            }
            c if is_word_char(c) => {
                let mut s = String::from(c);
                while let Some((_, c)) = chars.peek() {
                    if is_word_char(*c) {
                        s.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }

                match s.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Word(s),
                }
            }
            c => return Err(syntax_error(offset, format!("unexpected character '{}'", c))),
        };

        tokens.push((offset, token));
    }

    Ok(tokens)
}

fn read_quoted(
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
    offset: usize,
) -> Result<String, CodeSignError> {
    let mut s = String::new();

    loop {
        match chars.next() {
            Some((_, '"')) => return Ok(s),
            Some((_, '\\')) => match chars.next() {
                Some((_, c)) => s.push(c),
                None => return Err(syntax_error(offset, "unterminated string")),
            },
            Some((_, c)) => s.push(c),
            None => return Err(syntax_error(offset, "unterminated string")),
        }
    }
}

/// Encode a dotted OID string to its DER content bytes.
pub fn encode_oid(dotted: &str) -> Result<Vec<u8>, CodeSignError> {
    let bad = || syntax_error(0, format!("invalid OID: {}", dotted));

    let arcs = dotted
        .split('.')
        .map(|s| s.parse::<u64>().map_err(|_| bad()))
        .collect::<Result<Vec<_>, _>>()?;

    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(bad());
    }

    let mut res = vec![];
    let first = arcs[0]
        .checked_mul(40)
        .and_then(|v| v.checked_add(arcs[1]))
        .ok_or_else(bad)?;

    for arc in std::iter::once(first).chain(arcs[2..].iter().copied()) {
        let mut groups = vec![(arc & 0x7f) as u8];
        let mut rest = arc >> 7;
        while rest > 0 {
            groups.push(((rest & 0x7f) as u8) | 0x80);
            rest >>= 7;
        }
        res.extend(groups.into_iter().rev());
    }

    Ok(res)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .map(|(o, _)| *o)
            .unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, t)| t.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn error(&self, message: impl ToString) -> CodeSignError {
        syntax_error(self.offset(), message)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w == word => {
                self.position += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_hash(&mut self) -> Result<Vec<u8>, CodeSignError> {
        match self.next() {
            Some(Token::Hash(h)) => Ok(h),
            _ => Err(self.error("expected H\"<hex>\"")),
        }
    }

    fn expect_string(&mut self) -> Result<String, CodeSignError> {
        match self.next() {
            Some(Token::Str(s)) | Some(Token::Word(s)) => Ok(s),
            _ => Err(self.error("expected string")),
        }
    }

    fn expect_bracket(&mut self) -> Result<String, CodeSignError> {
        match self.next() {
            Some(Token::Bracket(s)) => Ok(s),
            _ => Err(self.error("expected '[<key>]'")),
        }
    }

    fn requirements(&mut self) -> Result<CodeRequirements<'static>, CodeSignError> {
        let mut exprs = vec![];

        loop {
            while self.eat(&Token::Semicolon) {}
            if self.peek().is_none() {
                break;
            }

            exprs.push(self.or_expr()?);

            match self.peek() {
                None | Some(Token::Semicolon) => {}
                Some(t) => return Err(self.error(format!("unexpected {:?}", t))),
            }
        }

        if exprs.is_empty() {
            return Err(self.error("empty requirement"));
        }

        Ok(CodeRequirements::from(exprs))
    }

    fn or_expr(&mut self) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        let mut expr = self.and_expr()?;

        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            expr = CodeRequirementExpression::Or(Box::new(expr), Box::new(rhs));
        }

        Ok(expr)
    }

    fn and_expr(&mut self) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        let mut expr = self.unary()?;

        while self.eat(&Token::And) {
            let rhs = self.unary()?;
            expr = CodeRequirementExpression::And(Box::new(expr), Box::new(rhs));
        }

        Ok(expr)
    }

    fn unary(&mut self) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        if self.eat(&Token::Not) {
            Ok(CodeRequirementExpression::Not(Box::new(self.unary()?)))
        } else {
            self.primary()
        }
    }

    fn primary(&mut self) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        type E = CodeRequirementExpression<'static>;

        let offset = self.offset();

        let word = match self.next() {
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                return Ok(expr);
            }
            Some(Token::Word(w)) => w,
            Some(t) => return Err(syntax_error(offset, format!("unexpected {:?}", t))),
            None => return Err(syntax_error(offset, "unexpected end of input")),
        };

        match word.as_str() {
            "always" | "true" => Ok(E::True),
            "never" | "false" => Ok(E::False),
            "notarized" => Ok(E::Notarized),
            "legacy" => Ok(E::LegacyDeveloperId),
            "identifier" => {
                self.eat(&Token::Eq);
                Ok(E::Identifier(Cow::Owned(self.expect_string()?)))
            }
            "cdhash" => {
                self.eat(&Token::Eq);
                Ok(E::CodeDirectoryHash(Cow::Owned(self.expect_hash()?)))
            }
            "platform" => {
                self.eat(&Token::Eq);
                let value = self.expect_string()?;
                let value = value
                    .parse::<u32>()
                    .map_err(|_| syntax_error(offset, "platform must be an integer"))?;
                Ok(E::Platform(value))
            }
            "anchor" => {
                if self.eat_word("apple") {
                    if self.eat_word("generic") {
                        Ok(E::AnchorAppleGeneric)
                    } else if let Some(Token::Word(name)) = self.peek().cloned() {
                        if name == "and" || name == "or" {
                            Ok(E::AnchorApple)
                        } else {
                            self.position += 1;
                            Ok(E::NamedAnchor(Cow::Owned(name)))
                        }
                    } else {
                        Ok(E::AnchorApple)
                    }
                } else if self.eat_word("trusted") {
                    Ok(E::AnchorTrusted)
                } else if self.eat(&Token::Eq) {
                    Ok(E::AnchorCertificateHash(-1, Cow::Owned(self.expect_hash()?)))
                } else {
                    self.certificate_tail(-1)
                }
            }
            "certificate" | "cert" => {
                let slot = match self.next() {
                    Some(Token::Word(w)) => match w.as_str() {
                        "leaf" => 0,
                        "root" | "anchor" => -1,
                        n => n
                            .parse::<i32>()
                            .map_err(|_| syntax_error(offset, "invalid certificate slot"))?,
                    },
                    _ => return Err(syntax_error(offset, "expected certificate slot")),
                };

                self.certificate_tail(slot)
            }
            "info" => {
                let key = self.expect_bracket()?;
                Ok(E::InfoPlistKeyField(Cow::Owned(key), self.match_expr()?))
            }
            "entitlement" => {
                let key = self.expect_bracket()?;
                Ok(E::EntitlementsKey(Cow::Owned(key), self.match_expr()?))
            }
            w => Err(syntax_error(offset, format!("unknown keyword '{}'", w))),
        }
    }

    fn certificate_tail(
        &mut self,
        slot: i32,
    ) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
        type E = CodeRequirementExpression<'static>;

        if self.eat_word("trusted") {
            return Ok(E::CertificateTrusted(slot));
        }
        if self.eat(&Token::Eq) {
            return Ok(E::AnchorCertificateHash(slot, Cow::Owned(self.expect_hash()?)));
        }

        let offset = self.offset();
        let field = self.expect_bracket()?;
        let m = self.match_expr()?;

        let oid = |dotted: &str| {
            encode_oid(dotted).map_err(|_| syntax_error(offset, format!("invalid OID in [{}]", field)))
        };

        if let Some(dotted) = field.strip_prefix("field.") {
            Ok(E::CertificateGeneric(slot, Cow::Owned(oid(dotted)?), m))
        } else if let Some(dotted) = field.strip_prefix("policy.") {
            Ok(E::CertificatePolicy(slot, Cow::Owned(oid(dotted)?), m))
        } else if let Some(dotted) = field.strip_prefix("timestamp.") {
            Ok(E::CertificateFieldDate(slot, Cow::Owned(oid(dotted)?), m))
        } else {
            Ok(E::CertificateField(slot, Cow::Owned(field.clone()), m))
        }
    }

    fn match_expr(&mut self) -> Result<CodeRequirementMatchExpression<'static>, CodeSignError> {
        type M = CodeRequirementMatchExpression<'static>;

        let offset = self.offset();

        let op = match self.next() {
            Some(Token::Word(w)) if w == "exists" => return Ok(M::Exists),
            Some(Token::Word(w)) if w == "absent" => return Ok(M::Absent),
            Some(t @ (Token::Eq | Token::Tilde | Token::Lt | Token::Gt | Token::Le | Token::Ge)) => t,
            _ => return Err(syntax_error(offset, "expected match operator")),
        };

        if self.eat_word("timestamp") {
            let s = self.expect_string()?;
            let t = chrono::DateTime::parse_from_rfc3339(&s)
                .map_err(|e| syntax_error(offset, format!("bad timestamp: {}", e)))?
                .with_timezone(&chrono::Utc);

            return match op {
                Token::Eq => Ok(M::On(t)),
                Token::Lt => Ok(M::Before(t)),
                Token::Gt => Ok(M::After(t)),
                Token::Le => Ok(M::OnOrBefore(t)),
                Token::Ge => Ok(M::OnOrAfter(t)),
                _ => Err(syntax_error(offset, "invalid timestamp operator")),
            };
        }

        let value: CodeRequirementValue<'static> = match self.next() {
            Some(Token::Hash(h)) => CodeRequirementValue::Bytes(Cow::Owned(h)),
            Some(Token::Str(s)) | Some(Token::Word(s)) => {
                if op == Token::Eq {
                    if let Some(rest) = s.strip_prefix('*') {
                        return Ok(M::EndsWith(rest.to_string().into()));
                    } else if let Some(rest) = s.strip_suffix('*') {
                        return Ok(M::BeginsWith(rest.to_string().into()));
                    }
                }
                s.into()
            }
            _ => return Err(syntax_error(offset, "expected match value")),
        };

        Ok(match op {
            Token::Eq => M::Equal(value),
            Token::Tilde => M::Contains(value),
            Token::Lt => M::LessThan(value),
            Token::Gt => M::GreaterThan(value),
            Token::Le => M::LessThanEqual(value),
            _ => M::GreaterThanEqual(value),
        })
    }
}

/// Parse requirement language text into expressions.
pub fn parse_requirements(text: &str) -> Result<CodeRequirements<'static>, CodeSignError> {
    let tokens = tokenize(text)?;

    let mut parser = Parser {
        tokens,
        position: 0,
        end: text.len(),
    };

    parser.requirements()
}

/// Parse requirement text that must hold exactly one expression.
pub fn parse_requirement_expression(
    text: &str,
) -> Result<CodeRequirementExpression<'static>, CodeSignError> {
    let mut reqs = parse_requirements(text)?;

    if reqs.len() != 1 {
        return Err(syntax_error(0, "expected a single requirement expression"));
    }

    reqs.pop()
        .ok_or_else(|| syntax_error(0, "empty requirement"))
}
