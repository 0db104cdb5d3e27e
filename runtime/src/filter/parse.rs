use super::*;
use winnow::{
    ModalResult, Parser,
    combinator::{alt, delimited, preceded, repeat},
    token::{any, none_of, take_while},
};

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_filter
            .parse(s)
            .map_err(|e| Error::Malformed(e.to_string()))
    }
}

// filter = "(" filtercomp ")"
fn parse_filter(input: &mut &str) -> ModalResult<Filter> {
    delimited('(', parse_filtercomp, ')').parse_next(input)
}

// filtercomp = and / or / not / item
fn parse_filtercomp(input: &mut &str) -> ModalResult<Filter> {
    alt((parse_and, parse_or, parse_not, parse_item)).parse_next(input)
}

// and = "&" filterlist
fn parse_and(input: &mut &str) -> ModalResult<Filter> {
    preceded('&', parse_filterlist)
        .map(Filter::And)
        .parse_next(input)
}

// or = "|" filterlist
fn parse_or(input: &mut &str) -> ModalResult<Filter> {
    preceded('|', parse_filterlist)
        .map(Filter::Or)
        .parse_next(input)
}

// not = "!" filter
fn parse_not(input: &mut &str) -> ModalResult<Filter> {
    preceded('!', parse_filter)
        .map(|f| Filter::Not(Box::new(f)))
        .parse_next(input)
}

// filterlist = 1*filter
fn parse_filterlist(input: &mut &str) -> ModalResult<Vec<Filter>> {
    repeat(1.., parse_filter).parse_next(input)
}

// item = key operator pattern
fn parse_item(input: &mut &str) -> ModalResult<Filter> {
    (parse_key, parse_operator, parse_pattern)
        .map(|(key, op, pattern)| Filter::Test(Comparison { key, op, pattern }))
        .parse_next(input)
}

// key = 1*(any char except whitespace, operator heads, parentheses and "*")
fn parse_key(input: &mut &str) -> ModalResult<Box<str>> {
    take_while(1.., |c: char| {
        !c.is_whitespace() && !matches!(c, '=' | '<' | '>' | '~' | '(' | ')' | '*')
    })
    .map(|s: &str| s.into())
    .parse_next(input)
}

// operator = "<=" / ">=" / "~=" / "="
fn parse_operator(input: &mut &str) -> ModalResult<Operator> {
    alt((
        "<=".value(Operator::LessEq),
        ">=".value(Operator::GreaterEq),
        "~=".value(Operator::Approx),
        '='.value(Operator::Equal),
    ))
    .parse_next(input)
}

#[derive(Clone)]
enum Chunk {
    Star,
    Char(char),
}

// chunk = "*" / "\" any / any char except "(" ")" "\" "*"
fn parse_chunk(input: &mut &str) -> ModalResult<Chunk> {
    alt((
        '*'.value(Chunk::Star),
        preceded('\\', any).map(Chunk::Char),
        none_of(['(', ')', '\\', '*']).map(Chunk::Char),
    ))
    .parse_next(input)
}

// pattern = 1*chunk, split on unescaped stars
fn parse_pattern(input: &mut &str) -> ModalResult<Pattern> {
    repeat(1.., parse_chunk)
        .map(|chunks: Vec<Chunk>| {
            let mut parts = vec![String::new()];
            let mut stars = 0usize;
            for chunk in chunks {
                match chunk {
                    Chunk::Star => {
                        parts.push(String::new());
                        stars += 1;
                    }
                    Chunk::Char(c) => {
                        if let Some(last) = parts.last_mut() {
                            last.push(c);
                        }
                    }
                }
            }
            if stars == 0 {
                Pattern::Literal(parts.concat().into())
            } else if stars == 1 && parts.iter().all(String::is_empty) {
                Pattern::Present
            } else {
                Pattern::Substring(parts.into_iter().map(Into::into).collect())
            }
        })
        .parse_next(input)
}
