use crate::{
    Error, FieldOperator, FieldRequirement, FieldSelector, LabelSelector, Operator, Requirement,
    Result,
};

fn is_alnum(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(is_alnum)
        && name.ends_with(is_alnum)
        && name
            .chars()
            .all(|c| is_alnum(c) || matches!(c, '-' | '_' | '.'))
}

// DNS-1123 subdomain
fn valid_prefix(prefix: &str) -> bool {
    prefix.len() <= 253
        && prefix.split('.').all(|part| {
            !part.is_empty()
                && part.starts_with(is_alnum)
                && part.ends_with(is_alnum)
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

fn check_key(key: &str) -> std::result::Result<String, &'static str> {
    let valid = match key.split_once('/') {
        Some((prefix, name)) => valid_prefix(prefix) && valid_name(name),
        None => valid_name(key),
    };
    if valid {
        Ok(key.to_owned())
    } else {
        Err("qualified label key")
    }
}

fn check_value(value: &str) -> std::result::Result<String, &'static str> {
    if value.is_empty() || valid_name(value) {
        Ok(value.to_owned())
    } else {
        Err("label value")
    }
}

peg::parser! {
    grammar parser() for str {
        rule _() = [' ' | '\t']*
        rule __() = [' ' | '\t']+

        rule key() -> String
            = key:$(['a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '/']+) {? check_key(key) }
        rule value() -> String
            = value:$(['a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.']*) {? check_value(value) }
        rule integer() -> String
            = value:$("-"? ['0'..='9']+) { value.to_owned() }
        rule values() -> Vec<String>
            = "(" _ values:(value() ** (_ "," _)) _ ")" {?
                if values.len() == 1 && values[0].is_empty() {
                    Err("non-empty value set")
                } else {
                    Ok(values)
                }
            }

        rule set_operator() -> Operator
            = "notin" { Operator::NotIn }
            / "in" { Operator::In }
        rule equality_operator() -> Operator
            = "==" { Operator::Equals }
            / "=" { Operator::Equals }
            / "!=" { Operator::NotEquals }
        rule compare_operator() -> Operator
            = ">" { Operator::GreaterThan }
            / "<" { Operator::LessThan }

        rule requirement() -> Requirement
            = "!" _ key:key() {
                Requirement::new(key, Operator::DoesNotExist, vec![])
            }
            / key:key() __ operator:set_operator() _ values:values() {
                Requirement::new(key, operator, values)
            }
            / key:key() _ operator:equality_operator() _ value:value() {
                Requirement::new(key, operator, vec![value])
            }
            / key:key() _ operator:compare_operator() _ value:integer() {
                Requirement::new(key, operator, vec![value])
            }
            / key:key() {
                Requirement::new(key, Operator::Exists, vec![])
            }

        pub rule labels() -> LabelSelector
            = _ requirements:(requirement() ** (_ "," _)) _ { LabelSelector(requirements) }

        rule escaped() -> char
            = "\\" c:['\\' | ',' | '=' | '!'] { c }
        rule plain() -> char
            = !['\\' | ','] c:[_] { c }
        rule field_value() -> String
            = chars:(escaped() / plain())* { chars.into_iter().collect() }
        rule field_key() -> String
            = key:$((!['=' | '!' | ','] [_])+) {?
                let key = key.trim();
                if key.is_empty() {
                    Err("field name")
                } else {
                    Ok(key.to_owned())
                }
            }
        rule field_operator() -> FieldOperator
            = "==" { FieldOperator::Equals }
            / "=" { FieldOperator::Equals }
            / "!=" { FieldOperator::NotEquals }
        rule field_requirement() -> FieldRequirement
            = field:field_key() operator:field_operator() value:field_value() {
                FieldRequirement { field, operator, value }
            }

        pub rule fields() -> FieldSelector
            = _ requirements:(field_requirement() ** ",") { FieldSelector(requirements) }
    }
}

pub fn parse_labels(input: &str) -> Result<LabelSelector> {
    parser::labels(input).map_err(|source| Error::Labels {
        input: input.to_owned(),
        source,
    })
}

pub fn parse_fields(input: &str) -> Result<FieldSelector> {
    parser::fields(input).map_err(|source| Error::Fields {
        input: input.to_owned(),
        source,
    })
}
