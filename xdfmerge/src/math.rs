//! Evaluator for XDF `MATH` equations such as `X*0.01` or `(X-40)*9/5+32`.
//!
//! Only used to present scaled values in review exports; decoding and
//! reconciliation work on raw values.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MathError {
    #[error("Unexpected end of equation")]
    UnexpectedEof,
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),
}

/// Evaluate `equation` with the variable `X` bound to `x`.
pub fn evaluate(equation: &str, x: f64) -> Result<f64, MathError> {
    let mut parser = EquationParser::new(equation, x);
    let value = parser.parse_expr()?;
    parser.skip_whitespace();
    if !parser.is_eof() {
        return Err(MathError::UnexpectedChar(parser.peek(), parser.pos));
    }
    Ok(value)
}

struct EquationParser {
    input: Vec<char>,
    pos: usize,
    x: f64,
}

impl EquationParser {
    fn new(input: &str, x: f64) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            x,
        }
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<f64, MathError> {
        let mut value = self.parse_term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                '+' => {
                    self.advance();
                    value += self.parse_term()?;
                }
                '-' => {
                    self.advance();
                    value -= self.parse_term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    // term := power (('*' | '/') power)*
    fn parse_term(&mut self) -> Result<f64, MathError> {
        let mut value = self.parse_power()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                '*' => {
                    self.advance();
                    value *= self.parse_power()?;
                }
                '/' => {
                    self.advance();
                    value /= self.parse_power()?;
                }
                _ => return Ok(value),
            }
        }
    }

    // power := unary ('^' power)?   (right associative)
    fn parse_power(&mut self) -> Result<f64, MathError> {
        let base = self.parse_unary()?;
        self.skip_whitespace();
        if self.peek() == '^' {
            self.advance();
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<f64, MathError> {
        self.skip_whitespace();
        match self.peek() {
            '-' => {
                self.advance();
                Ok(-self.parse_unary()?)
            }
            '+' => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<f64, MathError> {
        self.skip_whitespace();
        if self.is_eof() {
            return Err(MathError::UnexpectedEof);
        }
        let ch = self.peek();
        if ch == '(' {
            self.advance();
            let value = self.parse_expr()?;
            self.expect_char(')')?;
            Ok(value)
        } else if ch.is_ascii_digit() || ch == '.' {
            self.parse_number()
        } else if ch.is_ascii_alphabetic() || ch == '_' {
            self.parse_identifier()
        } else {
            Err(MathError::UnexpectedChar(ch, self.pos))
        }
    }

    fn parse_number(&mut self) -> Result<f64, MathError> {
        let start = self.pos;
        if self.peek() == '0' && matches!(self.peek_at(1), 'x' | 'X') {
            self.pos += 2;
            let digits_start = self.pos;
            while !self.is_eof() && self.peek().is_ascii_hexdigit() {
                self.advance();
            }
            let digits: String = self.input[digits_start..self.pos].iter().collect();
            return u64::from_str_radix(&digits, 16)
                .map(|v| v as f64)
                .map_err(|_| MathError::InvalidNumber(self.input[start..self.pos].iter().collect()));
        }

        while !self.is_eof() && (self.peek().is_ascii_digit() || self.peek() == '.') {
            self.advance();
        }
        if matches!(self.peek(), 'e' | 'E')
            && (self.peek_at(1).is_ascii_digit()
                || (matches!(self.peek_at(1), '+' | '-') && self.peek_at(2).is_ascii_digit()))
        {
            self.pos += 2;
            while !self.is_eof() && self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        text.parse().map_err(|_| MathError::InvalidNumber(text))
    }

    fn parse_identifier(&mut self) -> Result<f64, MathError> {
        let start = self.pos;
        while !self.is_eof() && (self.peek().is_ascii_alphanumeric() || self.peek() == '_') {
            self.advance();
        }
        let ident: String = self.input[start..self.pos].iter().collect();
        let lower = ident.to_ascii_lowercase();

        self.skip_whitespace();
        if self.peek() == '(' {
            self.advance();
            let arg = self.parse_expr()?;
            self.expect_char(')')?;
            return match lower.as_str() {
                "abs" => Ok(arg.abs()),
                "sqrt" => Ok(arg.sqrt()),
                "ln" | "log" => Ok(arg.ln()),
                "log10" => Ok(arg.log10()),
                "exp" => Ok(arg.exp()),
                "sin" => Ok(arg.sin()),
                "cos" => Ok(arg.cos()),
                "tan" => Ok(arg.tan()),
                "round" => Ok(arg.round()),
                "floor" => Ok(arg.floor()),
                "ceil" => Ok(arg.ceil()),
                _ => Err(MathError::UnknownIdentifier(ident)),
            };
        }

        match lower.as_str() {
            "x" => Ok(self.x),
            "pi" => Ok(std::f64::consts::PI),
            "e" => Ok(std::f64::consts::E),
            _ => Err(MathError::UnknownIdentifier(ident)),
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.peek().is_whitespace() {
            self.advance();
        }
    }

    fn peek(&self) -> char {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> char {
        self.input.get(self.pos + ahead).copied().unwrap_or('\0')
    }

    fn advance(&mut self) {
        if self.pos < self.input.len() {
            self.pos += 1;
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn expect_char(&mut self, expected: char) -> Result<(), MathError> {
        self.skip_whitespace();
        if self.is_eof() {
            return Err(MathError::UnexpectedEof);
        }
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(MathError::UnexpectedChar(self.peek(), self.pos))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_scale() {
        assert_eq!(evaluate("X", 42.0), Ok(42.0));
        assert_eq!(evaluate("x*0.5", 10.0), Ok(5.0));
    }

    #[test]
    fn test_precedence_and_parens() {
        assert_eq!(evaluate("(X-40)*9/5+32", 100.0), Ok(140.0));
        assert_eq!(evaluate("2+3*4", 0.0), Ok(14.0));
        assert_eq!(evaluate("2^3^2", 0.0), Ok(512.0));
        assert_eq!(evaluate("-X + 1", 3.0), Ok(-2.0));
    }

    #[test]
    fn test_hex_literal_and_functions() {
        assert_eq!(evaluate("X/0x10", 32.0), Ok(2.0));
        assert_eq!(evaluate("ABS(X-10)", 4.0), Ok(6.0));
        assert_eq!(evaluate("1e2*X", 2.0), Ok(200.0));
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("X*", 1.0), Err(MathError::UnexpectedEof));
        assert!(matches!(evaluate("Y+1", 1.0), Err(MathError::UnknownIdentifier(_))));
        assert!(matches!(evaluate("X)", 1.0), Err(MathError::UnexpectedChar(')', 1))));
    }
}
