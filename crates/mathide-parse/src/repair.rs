//! Expression escape repair
//!
//! Models often emit math markup such as `\sin` inside JSON string literals
//! with a single backslash. Depending on the letter that follows, that is
//! either an invalid escape (`\s`) or, worse, a valid one that silently
//! corrupts the text (`\frac` → form feed + `rac`). This module rewrites
//! known command names to the doubly escaped form, inside string literals
//! only, and leaves everything else untouched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

/// Command names that are rewritten when found single-escaped
pub const KNOWN_COMMANDS: &[&str] = &[
    // trigonometric and hyperbolic
    "sin", "cos", "tan", "cot", "sec", "csc", "arcsin", "arccos", "arctan", "arccot", "arcsec",
    "arccsc", "sinh", "cosh", "tanh", "coth", "sech", "csch",
    // logarithms, limits, extrema
    "log", "ln", "lg", "exp", "lim", "limsup", "liminf", "inf", "sup", "max", "min", "det", "gcd",
    // roots and fractions
    "sqrt", "cbrt", "frac", "dfrac", "tfrac", "over", "binom", "choose",
    // operators and relations
    "pm", "mp", "times", "div", "cdot", "ast", "circ", "leq", "geq", "neq", "le", "ge", "ne",
    "approx", "equiv", "propto", "sim", "ll", "gg", "sum", "prod", "int", "oint", "partial",
    "nabla", "infty", "to", "rightarrow", "leftarrow", "Rightarrow", "Leftrightarrow", "implies",
    "iff",
    // sets and logic
    "in", "notin", "subset", "subseteq", "supset", "supseteq", "cup", "cap", "emptyset",
    "varnothing", "setminus", "forall", "exists", "neg", "land", "lor",
    // greek letters
    "alpha", "beta", "gamma", "delta", "epsilon", "varepsilon", "zeta", "eta", "theta",
    "vartheta", "iota", "kappa", "lambda", "mu", "nu", "xi", "pi", "rho", "sigma", "tau",
    "upsilon", "phi", "varphi", "chi", "psi", "omega", "Gamma", "Delta", "Theta", "Lambda", "Xi",
    "Pi", "Sigma", "Phi", "Psi", "Omega",
    // layout
    "left", "right", "cdots", "ldots", "dots", "quad", "text", "mathbb", "mathrm", "overline",
    "vec", "hat", "bar", "angle", "perp", "parallel", "degree",
];

static COMMAND_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| KNOWN_COMMANDS.iter().copied().collect());

static DOUBLED_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\\([A-Za-z]+)").unwrap());

static SINGLE_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\([A-Za-z]+)").unwrap());

/// Check whether a command name is in the repair vocabulary
#[inline]
#[must_use]
pub fn is_known_command(name: &str) -> bool {
    COMMAND_SET.contains(name)
}

/// Rewrite single-escaped known commands inside JSON string literals
///
/// Structural punctuation outside literals is copied as-is. An unterminated
/// trailing literal is left unchanged. Idempotent on its own output.
#[must_use]
pub fn repair_expression_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut literal = String::new();
    let mut in_string = false;
    let mut backslashes = 0usize;

    for ch in text.chars() {
        let unescaped_quote = ch == '"' && backslashes % 2 == 0;

        if in_string {
            if unescaped_quote {
                out.push_str(&repair_literal(&literal));
                out.push('"');
                literal.clear();
                in_string = false;
            } else {
                literal.push(ch);
            }
        } else {
            out.push(ch);
            if unescaped_quote {
                in_string = true;
            }
        }

        backslashes = if ch == '\\' { backslashes + 1 } else { 0 };
    }

    if in_string {
        out.push_str(&literal);
    }

    out
}

/// Repair the inner content of a single string literal
///
/// Pass one hides already doubled commands behind placeholder tokens so the
/// rewrite pass cannot touch them; the tokens are restored afterwards.
fn repair_literal(content: &str) -> String {
    if !content.contains('\\') {
        return content.to_owned();
    }

    let mut masked: Vec<String> = Vec::new();
    let hidden = DOUBLED_COMMAND.replace_all(content, |caps: &Captures<'_>| {
        if is_known_command(&caps[1]) {
            let token = placeholder(masked.len());
            masked.push(caps[0].to_owned());
            token
        } else {
            caps[0].to_owned()
        }
    });

    let rewritten = SINGLE_COMMAND.replace_all(&hidden, |caps: &Captures<'_>| {
        let start = caps.get(0).map_or(0, |m| m.start());
        let escaped_backslash = hidden[..start].ends_with('\\');
        if !escaped_backslash && is_known_command(&caps[1]) {
            format!("\\\\{}", &caps[1])
        } else {
            caps[0].to_owned()
        }
    });

    let mut restored = rewritten.into_owned();
    for (index, original) in masked.iter().enumerate() {
        restored = restored.replacen(&placeholder(index), original, 1);
    }
    restored
}

fn placeholder(index: usize) -> String {
    format!("\u{E000}{index}\u{E001}")
}
