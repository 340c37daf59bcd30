use crate::ast::Value;
use crate::types;

pub fn format_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => out.push_str(&b.to_string()),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(n) => out.push_str(&format_float(*n)),
        Value::Ratio(r) => out.push_str(&format!("{}/{}", r.numer(), r.denom())),
        Value::Str(s) => {
            out.push('"');
            out.push_str(&escape_string(s));
            out.push('"');
        }
        Value::Regex(re) => {
            out.push_str("#\"");
            out.push_str(re.as_str());
            out.push('"');
        }
        Value::Symbol(sym) => out.push_str(&sym.to_string()),
        Value::Keyword(kw) => out.push_str(&kw.to_string()),
        Value::List(list) => write_seq(out, "(", ")", list.iter()),
        Value::Seq(seq) => write_seq(out, "(", ")", seq.iter()),
        Value::Vector(vec) => write_seq(out, "[", "]", vec.iter().cloned()),
        Value::Map(map) => {
            let mut parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{} {}", format_value(k), format_value(v)))
                .collect();
            parts.sort();
            out.push('{');
            out.push_str(&parts.join(", "));
            out.push('}');
        }
        Value::Set(set) => {
            let mut parts: Vec<String> = set.iter().map(format_value).collect();
            parts.sort();
            out.push_str("#{");
            out.push_str(&parts.join(" "));
            out.push('}');
        }
        Value::Func(native) => {
            out.push_str(&format!("#<fn {}>", native.name().unwrap_or("native")))
        }
        Value::Closure(closure) => out.push_str(&format!("#<fn {}>", closure.name())),
        Value::ProtocolFn(pfn) => {
            out.push_str(&format!("#<protocol-fn {}>", pfn.qualified_name()))
        }
        Value::Var(var) => out.push_str(&var.to_string()),
        Value::Type(key) => out.push_str(&types::type_name(*key)),
        Value::Instance(inst) => {
            let name = types::type_name(inst.type_key());
            match inst.message() {
                Some(msg) => out.push_str(&format!("#<{} {}>", name, msg)),
                None => out.push_str(&format!("#<{}>", name)),
            }
        }
        Value::Ref(handle) => {
            out.push_str("#<Atom ");
            write_value(out, &handle.deref());
            out.push('>');
        }
        Value::Transient(handle) => out.push_str(&format!("#<{:?}>", handle)),
        Value::Code(code) => out.push_str(&format!("#<code {}>", code.name)),
    }
}

fn write_seq(out: &mut String, open: &str, close: &str, items: impl Iterator<Item = Value>) {
    out.push_str(open);
    for (idx, item) in items.enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        write_value(out, &item);
    }
    out.push_str(close);
}

fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_collections_print_readably() {
        let value = Value::list(vec![
            Value::Int(1),
            Value::vector(vec![Value::string("a\"b"), Value::Nil]),
            Value::Float(2.0),
        ]);
        assert_eq!(format_value(&value), "(1 [\"a\\\"b\" nil] 2.0)");
    }
}
