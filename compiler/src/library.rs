// library.rs — Runtime library classes in textual IR
//
// The token hierarchy, attribute classes, ports, actors and the dynamic
// expression evaluator that generated code links against. Everything is
// written in the textual IR and parsed once per run, so passes see library
// methods exactly like user methods: token arithmetic can be inlined into
// actor bodies and then unboxed. Methods the interpreter implements itself
// (port I/O, the composite director, name lookups) are `native`.
//
// Numeric token arithmetic promotes like the type lattice: the class of a
// result is the least upper bound of the operand types whenever that bound
// is instantiable (`Int + Long` is a `LongToken`, `Long + Double` computes in
// double).
//
// Preconditions: none.
// Postconditions: `runtime_library` lowers without errors.
// Failure modes: none in practice; lowering errors would surface as
//   `SpecializeError::Parse`.
// Side effects: none.

use std::fmt::Write;

use crate::error::Result;
use crate::ir::{MethodRef, Program};
use crate::lower::parse_ir;

pub const ACTOR_CLASS: &str = "Actor";
pub const COMPOSITE_CLASS: &str = "CompositeActor";
pub const PORT_CLASS: &str = "IOPort";
pub const ATTRIBUTE_CLASS: &str = "Attribute";
pub const PARAMETER_CLASS: &str = "Parameter";
pub const EXPRESSION_CLASS: &str = "Expression";
pub const ARRAY_TOKEN_CLASS: &str = "ArrayToken";
pub const BOOLEAN_TOKEN_CLASS: &str = "BooleanToken";

/// Lifecycle methods every actor implements, in invocation order.
pub const LIFECYCLE: [&str; 6] = [
    "preinitialize",
    "initialize",
    "prefire",
    "fire",
    "postfire",
    "wrapup",
];

/// Token methods whose result is the least upper bound of both operands.
pub const ARITHMETIC: [&str; 5] = ["add", "subtract", "multiply", "divide", "modulo"];

/// Natives without side effects; unused calls to them can be dropped.
pub fn is_pure_native(method: &MethodRef) -> bool {
    matches!(
        (method.class.as_str(), method.name.as_str()),
        ("Actor", "getAttribute")
            | ("Actor", "getPort")
            | ("IOPort", "getWidth")
            | ("IOPort", "hasToken")
            | ("IOPort", "hasTokenInside")
    )
}

/// Names of every class the library declares.
pub fn class_names() -> Vec<&'static str> {
    vec![
        "Token",
        "ScalarToken",
        "BooleanToken",
        "IntToken",
        "LongToken",
        "DoubleToken",
        "StringToken",
        "ArrayToken",
        "Attribute",
        "Parameter",
        "Variable",
        "StringParameter",
        "Actor",
        "CompositeActor",
        "IOPort",
        "Expression",
    ]
}

pub fn is_library_class(name: &str) -> bool {
    class_names().contains(&name)
}

/// Parse the library.
pub fn runtime_library() -> Result<Program> {
    parse_ir(&source(), &Program::new())
}

// ── Source generation ───────────────────────────────────────────────────────

const OPS: [(&str, &str); 5] = [
    ("add", "+"),
    ("subtract", "-"),
    ("multiply", "*"),
    ("divide", "/"),
    ("modulo", "%"),
];

/// A numeric token class: name, primitive, zero and one literals, and the
/// promotion cases tried in order as (operand class, computation primitive,
/// result class). The final fallback computes in double.
struct Numeric {
    class: &'static str,
    prim: &'static str,
    zero: &'static str,
    one: &'static str,
    cases: &'static [(&'static str, &'static str, &'static str)],
}

const NUMERICS: [Numeric; 3] = [
    Numeric {
        class: "IntToken",
        prim: "int",
        zero: "0",
        one: "1",
        cases: &[("IntToken", "int", "IntToken"), ("LongToken", "long", "LongToken")],
    },
    Numeric {
        class: "LongToken",
        prim: "long",
        zero: "0L",
        one: "1L",
        cases: &[("IntToken", "long", "LongToken"), ("LongToken", "long", "LongToken")],
    },
    Numeric {
        class: "DoubleToken",
        prim: "double",
        zero: "0.0",
        one: "1.0",
        cases: &[],
    },
];

fn value_method(prim: &str) -> &'static str {
    match prim {
        "int" => "intValue",
        "long" => "longValue",
        _ => "doubleValue",
    }
}

/// Full library source text.
pub fn source() -> String {
    let mut s = String::from(BASE);
    for n in &NUMERICS {
        numeric_class(&mut s, n);
    }
    s.push_str(BOOLEAN);
    s.push_str(STRING);
    array_class(&mut s);
    s.push_str(ACTORS);
    s
}

fn numeric_class(s: &mut String, n: &Numeric) {
    let (k, p) = (n.class, n.prim);
    let _ = writeln!(s, "class {k} extends ScalarToken {{");
    let _ = writeln!(s, "    field _value: {p};");
    let _ = write!(
        s,
        "
    method <init>(v: {p}) {{
        this._value = v;
        return;
    }}
"
    );
    for (name, target) in [("intValue", "int"), ("longValue", "long"), ("doubleValue", "double")] {
        if target == p {
            let _ = write!(
                s,
                "
    method {name}(): {target} {{
        local v: {p};
        v = this._value;
        return v;
    }}
"
            );
        } else {
            let _ = write!(
                s,
                "
    method {name}(): {target} {{
        local v: {p};
        local r: {target};
        v = this._value;
        r = ({target}) v;
        return r;
    }}
"
            );
        }
    }
    let _ = write!(
        s,
        "
    method stringValue(): string {{
        local v: {p};
        local r: string;
        v = this._value;
        r = (string) v;
        return r;
    }}

    method zero(): Token {{
        local r: {k};
        r = new {k};
        specialinvoke r.<init>({zero});
        return r;
    }}

    method one(): Token {{
        local r: {k};
        r = new {k};
        specialinvoke r.<init>({one});
        return r;
    }}

    method isEqualTo(other: Token): BooleanToken {{
        local o: ScalarToken;
        local v: {p};
        local a: double;
        local b: double;
        local r: BooleanToken;
        o = (ScalarToken) other;
        v = this._value;
        a = (double) v;
        b = virtualinvoke o.doubleValue();
        if a == b goto same;
        r = BooleanToken::FALSE;
        return r;
    same:
        r = BooleanToken::TRUE;
        return r;
    }}
",
        zero = n.zero,
        one = n.one
    );
    for (name, sym) in OPS {
        arithmetic_method(s, n, name, sym);
    }
    let _ = writeln!(s, "}}\n");
}

fn arithmetic_method(s: &mut String, n: &Numeric, name: &str, sym: &str) {
    let p = n.prim;
    let _ = write!(
        s,
        "
    method {name}(other: Token): Token {{
        local z: boolean;
        local v: {p};
        local o: ScalarToken;
        local sa: string;
        local sb: string;
        local sc: string;
        local sr: StringToken;
        z = other instanceof StringToken;
        if z == false goto numeric;
        sa = virtualinvoke this.stringValue();
        sb = virtualinvoke other.stringValue();
        sc = sa + sb;
        sr = new StringToken;
        specialinvoke sr.<init>(sc);
        return sr;
    numeric:
"
    );
    let mut cases: Vec<(&str, &str, &str)> = n.cases.to_vec();
    cases.push(("", "double", "DoubleToken"));
    for (i, (test, q, result)) in cases.iter().enumerate() {
        let _ = writeln!(s, "        local a{i}: {q};");
        let _ = writeln!(s, "        local b{i}: {q};");
        let _ = writeln!(s, "        local c{i}: {q};");
        let _ = writeln!(s, "        local r{i}: {result};");
        if !test.is_empty() {
            let _ = writeln!(s, "        z = other instanceof {test};");
            let _ = writeln!(s, "        if z == false goto case{};", i + 1);
        }
        let _ = writeln!(s, "        v = this._value;");
        if *q == p {
            let _ = writeln!(s, "        a{i} = v;");
        } else {
            let _ = writeln!(s, "        a{i} = ({q}) v;");
        }
        let _ = writeln!(s, "        o = (ScalarToken) other;");
        let _ = writeln!(s, "        b{i} = virtualinvoke o.{}();", value_method(q));
        let _ = writeln!(s, "        c{i} = a{i} {sym} b{i};");
        let _ = writeln!(s, "        r{i} = new {result};");
        let _ = writeln!(s, "        specialinvoke r{i}.<init>(c{i});");
        let _ = writeln!(s, "        return r{i};");
        if !test.is_empty() {
            let _ = writeln!(s, "    case{}:", i + 1);
        }
    }
    let _ = writeln!(s, "    }}");
}

fn array_class(s: &mut String) {
    s.push_str(ARRAY_HEAD);
    for (name, _) in OPS {
        let _ = write!(
            s,
            "
    method {name}(other: Token): Token {{
        local o: ArrayToken;
        local a: Token[];
        local b: Token[];
        local out: Token[];
        local n: int;
        local i: int;
        local x: Token;
        local y: Token;
        local z: Token;
        local r: ArrayToken;
        o = (ArrayToken) other;
        a = this._value;
        b = o._value;
        n = lengthof a;
        out = newarray Token[n];
        i = 0;
    loop:
        if i >= n goto done;
        x = a[i];
        y = b[i];
        z = virtualinvoke x.{name}(y);
        out[i] = z;
        i = i + 1;
        goto loop;
    done:
        r = new ArrayToken;
        specialinvoke r.<init>(out);
        return r;
    }}
"
        );
    }
    let _ = writeln!(s, "}}\n");
}

const BASE: &str = r#"
class Token {
    abstract method add(other: Token): Token;
    abstract method subtract(other: Token): Token;
    abstract method multiply(other: Token): Token;
    abstract method divide(other: Token): Token;
    abstract method modulo(other: Token): Token;
    abstract method isEqualTo(other: Token): BooleanToken;
    abstract method zero(): Token;
    abstract method one(): Token;
    abstract method stringValue(): string;
}

class ScalarToken extends Token {
    abstract method intValue(): int;
    abstract method longValue(): long;
    abstract method doubleValue(): double;
}

"#;

const BOOLEAN: &str = r#"
class BooleanToken extends Token {
    static field TRUE: BooleanToken;
    static field FALSE: BooleanToken;
    field _value: boolean;

    static method <clinit>() {
        local t: BooleanToken;
        local f: BooleanToken;
        t = new BooleanToken;
        specialinvoke t.<init>(true);
        BooleanToken::TRUE = t;
        f = new BooleanToken;
        specialinvoke f.<init>(false);
        BooleanToken::FALSE = f;
        return;
    }

    method <init>(v: boolean) {
        this._value = v;
        return;
    }

    method booleanValue(): boolean {
        local v: boolean;
        v = this._value;
        return v;
    }

    method stringValue(): string {
        local v: boolean;
        local r: string;
        v = this._value;
        r = (string) v;
        return r;
    }

    method add(other: Token): Token {
        local o: BooleanToken;
        local a: boolean;
        local b: boolean;
        local c: boolean;
        local r: BooleanToken;
        o = (BooleanToken) other;
        a = this._value;
        b = o._value;
        c = a | b;
        r = new BooleanToken;
        specialinvoke r.<init>(c);
        return r;
    }

    method multiply(other: Token): Token {
        local o: BooleanToken;
        local a: boolean;
        local b: boolean;
        local c: boolean;
        local r: BooleanToken;
        o = (BooleanToken) other;
        a = this._value;
        b = o._value;
        c = a & b;
        r = new BooleanToken;
        specialinvoke r.<init>(c);
        return r;
    }

    method isEqualTo(other: Token): BooleanToken {
        local o: BooleanToken;
        local a: boolean;
        local b: boolean;
        local r: BooleanToken;
        o = (BooleanToken) other;
        a = this._value;
        b = o._value;
        if a == b goto same;
        r = BooleanToken::FALSE;
        return r;
    same:
        r = BooleanToken::TRUE;
        return r;
    }

    method zero(): Token {
        local r: BooleanToken;
        r = BooleanToken::FALSE;
        return r;
    }

    method one(): Token {
        local r: BooleanToken;
        r = BooleanToken::TRUE;
        return r;
    }
}

"#;

const STRING: &str = r#"
class StringToken extends Token {
    field _value: string;

    method <init>(v: string) {
        this._value = v;
        return;
    }

    method stringValue(): string {
        local v: string;
        v = this._value;
        return v;
    }

    method add(other: Token): Token {
        local a: string;
        local b: string;
        local c: string;
        local r: StringToken;
        a = this._value;
        b = virtualinvoke other.stringValue();
        c = a + b;
        r = new StringToken;
        specialinvoke r.<init>(c);
        return r;
    }

    method isEqualTo(other: Token): BooleanToken {
        local a: string;
        local b: string;
        local r: BooleanToken;
        a = this._value;
        b = virtualinvoke other.stringValue();
        if a == b goto same;
        r = BooleanToken::FALSE;
        return r;
    same:
        r = BooleanToken::TRUE;
        return r;
    }

    method zero(): Token {
        local r: StringToken;
        r = new StringToken;
        specialinvoke r.<init>("");
        return r;
    }
}

"#;

const ARRAY_HEAD: &str = r#"
class ArrayToken extends Token {
    field _value: Token[];

    method <init>(v: Token[]) {
        this._value = v;
        return;
    }

    method length(): int {
        local v: Token[];
        local n: int;
        v = this._value;
        n = lengthof v;
        return n;
    }

    method getElement(i: int): Token {
        local v: Token[];
        local t: Token;
        v = this._value;
        t = v[i];
        return t;
    }

    method arrayValue(): Token[] {
        local v: Token[];
        v = this._value;
        return v;
    }

    method stringValue(): string {
        local v: Token[];
        local n: int;
        local i: int;
        local t: Token;
        local e: string;
        local r: string;
        v = this._value;
        n = lengthof v;
        r = "{";
        i = 0;
    loop:
        if i >= n goto done;
        if i == 0 goto first;
        r = r + ", ";
    first:
        t = v[i];
        e = virtualinvoke t.stringValue();
        r = r + e;
        i = i + 1;
        goto loop;
    done:
        r = r + "}";
        return r;
    }
"#;

const ACTORS: &str = r#"
class Attribute {
    field _name: string;
    field _container: Actor;

    method getName(): string {
        local r: string;
        r = this._name;
        return r;
    }

    method getContainer(): Actor {
        local r: Actor;
        r = this._container;
        return r;
    }
}

class Parameter extends Attribute {
    field _token: Token;
    field _expression: string;

    method getToken(): Token {
        local t: Token;
        local c: Actor;
        local e: string;
        t = this._token;
        if t != null goto done;
        c = this._container;
        e = this._expression;
        t = staticinvoke Expression::evaluate(c, e);
    done:
        return t;
    }

    method setToken(t: Token) {
        local c: Actor;
        this._token = t;
        c = this._container;
        virtualinvoke c.attributeChanged(this);
        return;
    }

    method getExpression(): string {
        local r: string;
        r = this._expression;
        return r;
    }
}

class Variable extends Parameter {
}

class StringParameter extends Parameter {
}

class Actor {
    field _name: string;
    field _container: CompositeActor;

    method <init>() {
        return;
    }

    method preinitialize() {
        return;
    }

    method initialize() {
        return;
    }

    method prefire(): boolean {
        return true;
    }

    method fire() {
        return;
    }

    method postfire(): boolean {
        return true;
    }

    method wrapup() {
        return;
    }

    method attributeChanged(a: Attribute) {
        return;
    }

    method getName(): string {
        local r: string;
        r = this._name;
        return r;
    }

    native method getAttribute(name: string): Attribute;
    native method getPort(name: string): IOPort;
}

class CompositeActor extends Actor {
    native method preinitialize();
    native method initialize();
    native method prefire(): boolean;
    native method fire();
    native method postfire(): boolean;
    native method wrapup();
}

class IOPort {
    field _name: string;
    field _container: Actor;

    native method get(channel: int): Token;
    native method send(channel: int, token: Token);
    native method getInside(channel: int): Token;
    native method sendInside(channel: int, token: Token);
    native method hasToken(channel: int): boolean;
    native method hasTokenInside(channel: int): boolean;
    native method getWidth(): int;
}

class Expression {
    static dynamic native method evaluate(scope: Actor, text: string): Token;
}
"#;
