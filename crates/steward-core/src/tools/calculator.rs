//! Arithmetic expression tool.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{schema_for, Tool};

/// Deepest nesting of parentheses, calls, signs and exponents accepted.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculatorArgs {
    /// Expression to evaluate, e.g. `(2 + 3) * 4 ^ 2`.
    expression: String,
}

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses, \
         the constants pi and e, and sqrt/abs/ln/floor/ceil/round."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<CalculatorArgs>()
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let args: CalculatorArgs =
            serde_json::from_value(params).context("expected {\"expression\": string}")?;
        let value = evaluate(&args.expression)?;
        Ok(format_number(value))
    }
}

pub fn evaluate(expression: &str) -> Result<f64> {
    let mut parser = Parser {
        src: expression.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.src.len() {
        bail!(
            "unexpected '{}' at position {}",
            parser.src[parser.pos] as char,
            parser.pos
        );
    }
    if !value.is_finite() {
        bail!("result is not a finite number");
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

// expr   := term (('+' | '-') term)*
// term   := power (('*' | '/' | '%') power)*
// power  := unary ('^' power)?
// unary  := ('-' | '+') unary | atom
// atom   := number | ident | ident '(' expr ')' | '(' expr ')'
struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            bail!("expression nested too deeply (limit {MAX_DEPTH})");
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    fn expr(&mut self) -> Result<f64> {
        let mut acc = self.term()?;
        loop {
            if self.eat(b'+') {
                acc += self.term()?;
            } else if self.eat(b'-') {
                acc -= self.term()?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn term(&mut self) -> Result<f64> {
        let mut acc = self.power()?;
        loop {
            if self.eat(b'*') {
                acc *= self.power()?;
            } else if self.eat(b'/') {
                let rhs = self.power()?;
                if rhs == 0.0 {
                    bail!("division by zero");
                }
                acc /= rhs;
            } else if self.eat(b'%') {
                let rhs = self.power()?;
                if rhs == 0.0 {
                    bail!("modulo by zero");
                }
                acc %= rhs;
            } else {
                return Ok(acc);
            }
        }
    }

    fn power(&mut self) -> Result<f64> {
        let base = self.unary()?;
        if self.eat(b'^') {
            self.descend()?;
            let exp = self.power()?;
            self.ascend();
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64> {
        let negate = if self.eat(b'-') {
            true
        } else if self.eat(b'+') {
            false
        } else {
            return self.atom();
        };
        self.descend()?;
        let value = self.unary()?;
        self.ascend();
        Ok(if negate { -value } else { value })
    }

    fn atom(&mut self) -> Result<f64> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                self.descend()?;
                let value = self.expr()?;
                self.ascend();
                if !self.eat(b')') {
                    bail!("missing ')' at position {}", self.pos);
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.ident(),
            Some(c) => bail!("unexpected '{}' at position {}", c as char, self.pos),
            None => bail!("unexpected end of expression"),
        }
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while self.pos < self.src.len()
            && (self.src[self.pos].is_ascii_digit() || self.src[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])?;
        text.parse::<f64>()
            .with_context(|| format!("invalid number '{text}'"))
    }

    fn ident(&mut self) -> Result<f64> {
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.src[start..self.pos])?.to_ascii_lowercase();
        match name.as_str() {
            "pi" => return Ok(std::f64::consts::PI),
            "e" => return Ok(std::f64::consts::E),
            _ => {}
        }
        if !self.eat(b'(') {
            bail!("unknown identifier '{name}'");
        }
        self.descend()?;
        let arg = self.expr()?;
        self.ascend();
        if !self.eat(b')') {
            bail!("missing ')' after {name}(");
        }
        match name.as_str() {
            "sqrt" if arg < 0.0 => bail!("sqrt of a negative number"),
            "sqrt" => Ok(arg.sqrt()),
            "abs" => Ok(arg.abs()),
            "ln" if arg <= 0.0 => bail!("ln of a non-positive number"),
            "ln" => Ok(arg.ln()),
            "floor" => Ok(arg.floor()),
            "ceil" => Ok(arg.ceil()),
            "round" => Ok(arg.round()),
            other => bail!("unknown function '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(evaluate("2 + 2").unwrap(), 4.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("10 - 4 - 3").unwrap(), 3.0);
        assert_eq!(evaluate("7 % 4").unwrap(), 3.0);
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(evaluate("sqrt(16) + abs(-2)").unwrap(), 6.0);
        assert_eq!(evaluate("round(2.6)").unwrap(), 3.0);
        assert!((evaluate("pi").unwrap() - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn errors_are_reported() {
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 2").is_err());
        assert!(evaluate("foo(1)").is_err());
        assert!(evaluate("sqrt(-1)").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = evaluate(&parens).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"), "{err}");

        assert!(evaluate(&"-".repeat(100_000)).is_err());
        assert!(evaluate(&"2^".repeat(100_000)).is_err());
        assert!(evaluate(&format!("{}1{}", "sqrt(".repeat(100_000), ")".repeat(100_000))).is_err());
    }

    #[test]
    fn moderate_nesting_still_evaluates() {
        let expr = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&expr).unwrap(), 1.0);
        assert_eq!(evaluate("--2").unwrap(), 2.0);
    }

    #[test]
    fn integers_print_without_fraction() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn tool_evaluates_expression_argument() {
        let out = CalculatorTool
            .execute(serde_json::json!({"expression": "2+2"}))
            .await
            .unwrap();
        assert_eq!(out, "4");
    }

    #[test]
    fn schema_requires_expression() {
        let schema = CalculatorTool.parameters_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], serde_json::json!(["expression"]));
        assert_eq!(schema["properties"]["expression"]["type"], "string");
    }
}
