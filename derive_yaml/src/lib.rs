extern crate proc_macro;

use proc_macro::{Delimiter, TokenStream, TokenTree};

#[proc_macro_derive(FromYaml)]
pub fn derive_from_yaml(input: TokenStream) -> TokenStream {
    let struct_name = match extract_struct_name(input.clone()) {
        Some(name) => name,
        None => return quote_error("Failed to extract struct name"),
    };

    let fields = match extract_struct_fields(input) {
        Some(f) => f,
        None => return quote_error("Failed to extract struct fields"),
    };

    let arms = generate_match_arms(&fields);

    let code = format_impl_code(&struct_name, &arms);

    code.parse().unwrap_or_else(|_| quote_error("Generated code was invalid"))
}

// ====== Field Extraction ======

fn extract_struct_name(input: TokenStream) -> Option<String> {
    let mut tokens = input.into_iter();

    while let Some(token) = tokens.next() {
        if let TokenTree::Ident(ident) = token {
            if ident.to_string() == "struct" {
                if let Some(TokenTree::Ident(name)) = tokens.next() {
                    return Some(name.to_string());
                }
            }
        }
    }

    None
}

fn extract_struct_fields(input: TokenStream) -> Option<Vec<String>> {
    let tokens: Vec<TokenTree> = input.into_iter().collect();
    let mut fields = Vec::new();

    // Find the opening brace
    for token in tokens.iter() {
        if let TokenTree::Group(group) = token {
            if group.delimiter() == Delimiter::Brace {
                parse_field_names(group.stream(), &mut fields);
                return Some(fields);
            }
        }
    }

    None
}

fn parse_field_names(group_stream: TokenStream, fields: &mut Vec<String>) {
    let mut group_iter = group_stream.into_iter();
    let mut last_ident = String::new();

    while let Some(inner_token) = group_iter.next() {
        match inner_token {
            TokenTree::Ident(ident) => {
                let s = ident.to_string();
                // Skip keywords and type hints
                if !is_keyword_or_type(&s) {
                    last_ident = s;
                }
            }
            TokenTree::Punct(punct) => {
                if punct.as_char() == ':' {
                    if !last_ident.is_empty() {
                        fields.push(last_ident.clone());
                        last_ident.clear();
                    }
                    // Skip until comma
                    skip_to_comma(&mut group_iter);
                }
            }
            _ => {}
        }
    }
}

fn is_keyword_or_type(s: &str) -> bool {
    matches!(s, "pub")
}

fn skip_to_comma(iter: &mut impl Iterator<Item = TokenTree>) {
    while let Some(token) = iter.next() {
        if let TokenTree::Punct(p) = token {
            if p.as_char() == ',' {
                break;
            }
        }
    }
}

// ====== Code Generation ======

/// One arm per field: if the parsed mapping has that key, override the
/// `Default::default()` value already sitting in `obj`. Fields absent from
/// the YAML fragment keep their default, which is what lets a driver config
/// specify only the knobs it wants to change.
fn generate_match_arms(fields: &[String]) -> String {
    let mut arms = String::new();

    for field in fields {
        arms.push_str(&format!(
            "if let Some(v) = __map.get({q}{field}{q}) {{\n    obj.{field} = ::parser::FromYaml::from_yaml(v)?;\n}}\n",
            field = field,
            q = "\""
        ));
    }

    arms
}

fn format_impl_code(struct_name: &str, arms: &str) -> String {
    format!(
        r#"impl ::parser::FromYaml for {struct_name} {{
    fn from_yaml(value: &::parser::YamlValue) -> ::std::result::Result<Self, ::parser::YamlError> {{
        let mut obj = Self::default();
        let __map = match value {{
            ::parser::YamlValue::Map(m) => m,
            _ => return Err(::parser::YamlError::Generic("expected a mapping".to_string())),
        }};
        {arms}
        Ok(obj)
    }}
}}"#,
        struct_name = struct_name,
        arms = arms
    )
}

// ====== Error Handling ======

fn quote_error(msg: &str) -> TokenStream {
    format!(
        "compile_error!(\"FromYaml derive error: {}\");",
        msg
    )
    .parse()
    .unwrap()
}