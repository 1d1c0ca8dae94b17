//! End-to-end emission tests: template source in, compiled Rust source
//! out, checked against the fixed conversion contracts.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;

use tplc::config::{Configuration, TemplateConfiguration, TemplateSource};
use tplc::error::CompileError;
use tplc::funcs::{Funcs, PublicIdent};
use tplc::reflect::{FieldDef, FnSig, MethodDef, Ty, TypeBody, TypeDef};

const DATA: &str = "demo::model::TemplateData";

fn type_env() -> tplc::reflect::TypeEnv {
    let mut env = tplc::reflect::TypeEnv::new();
    env.register(TypeDef {
        name: "TemplateData".to_string(),
        module: "demo::model".to_string(),
        public: true,
        body: TypeBody::Struct {
            fields: vec![
                FieldDef {
                    name: "some_string".to_string(),
                    ty: Ty::Str,
                },
                FieldDef {
                    name: "some_bool".to_string(),
                    ty: Ty::Bool,
                },
                FieldDef {
                    name: "some_int".to_string(),
                    ty: Ty::Isize,
                },
                FieldDef {
                    name: "some_int8".to_string(),
                    ty: Ty::I8,
                },
                FieldDef {
                    name: "some_uint64".to_string(),
                    ty: Ty::U64,
                },
                FieldDef {
                    name: "some_float32".to_string(),
                    ty: Ty::F32,
                },
                FieldDef {
                    name: "some_byte_slice".to_string(),
                    ty: Ty::Slice(Box::new(Ty::U8)),
                },
                FieldDef {
                    name: "some_rune_slice".to_string(),
                    ty: Ty::Slice(Box::new(Ty::I32)),
                },
                FieldDef {
                    name: "items".to_string(),
                    ty: Ty::Slice(Box::new(Ty::Str)),
                },
                FieldDef {
                    name: "some_map".to_string(),
                    ty: Ty::Map(Box::new(Ty::Str), Box::new(Ty::Isize)),
                },
                FieldDef {
                    name: "child".to_string(),
                    ty: Ty::Ref(Box::new(Ty::Named(DATA.to_string()))),
                },
                FieldDef {
                    name: "friends".to_string(),
                    ty: Ty::Slice(Box::new(Ty::Named(DATA.to_string()))),
                },
            ],
            methods: vec![
                MethodDef {
                    name: "method_hello".to_string(),
                    sig: FnSig::new(vec![], vec![Ty::Str]),
                },
                MethodDef {
                    name: "method_arg_hello".to_string(),
                    sig: FnSig::new(vec![Ty::Str], vec![Ty::Str]),
                },
                MethodDef {
                    name: "method_may_fail".to_string(),
                    sig: FnSig::new(vec![Ty::Str], vec![Ty::Str, Ty::Error]),
                },
            ],
        },
    });
    env
}

fn config(tpl: &str, html_mode: bool, funcs: Funcs, public_idents: Vec<PublicIdent>) -> Configuration {
    let mut data = BTreeMap::new();
    data.insert("*".to_string(), Ty::Named(DATA.to_string()));
    Configuration {
        out_path: "gen.rs".into(),
        out_module: Some("demo".to_string()),
        templates: vec![TemplateConfiguration {
            html_mode,
            source: TemplateSource::Inline {
                name: "t.tpl".to_string(),
                content: tpl.to_string(),
            },
            data,
            funcs,
            public_idents,
        }],
        registry_variable: "TEMPLATES".to_string(),
        funcs_provider: None,
        type_env: type_env(),
    }
}

fn compile(tpl: &str) -> String {
    tplc::compile(&config(tpl, false, Funcs::new(), vec![])).unwrap()
}

#[track_caller]
fn assert_has(src: &str, fragment: &str) {
    assert!(
        src.contains(fragment),
        "missing fragment {fragment:?} in:\n{src}"
    );
}

#[test]
fn test_plain_text() {
    let src = compile("Hello!");
    assert_has(&src, "static BUILTIN0: &[u8] = b\"Hello!\";");
    assert_has(&src, "fn fn_t_tpl_0(");
    assert_has(&src, "if let Err(err) = w.write_all(BUILTIN0) {");
    assert_has(&src, "return Err(err.into());");
    assert_has(&src, "registry.add(\"t.tpl\", fn_t_tpl_0);");
    // No data prelude and no templater use.
    assert_has(&src, "_t: &dyn Templater");
    assert_has(&src, "_indata: &dyn Any");
    assert!(!src.contains("downcast_ref"), "unexpected prelude:\n{src}");
}

#[test]
fn test_empty_template_is_just_ok() {
    let src = compile("");
    assert_has(&src, "    Ok(())\n}");
    assert_has(&src, "_w: &mut dyn Write");
    assert!(!src.contains("BUILTIN"), "unexpected literal:\n{src}");
}

#[test]
fn test_typed_declaration() {
    let src = compile(r#"{{$y := "Hello!"}}"#);
    assert_has(&src, "let tpl_y: String = \"Hello!\".to_string();");
    assert!(!src.contains("BUILTIN"), "unexpected literal:\n{src}");
    // Declaring without printing leaves the writer unused.
    assert_has(&src, "_w: &mut dyn Write");
    assert!(!src.contains("let err"), "unexpected error binding:\n{src}");
}

#[test]
fn test_print_declared_variable() {
    let src = compile(r#"{{$y := "Hello!"}}{{$y}}"#);
    assert_has(&src, "if let Err(err) = w.write_all(tpl_y.as_bytes()) {");
}

#[test]
fn test_integer_print_with_data_prelude() {
    let src = compile("{{.some_int}}");
    assert_has(&src, "let data: model::TemplateData = match indata");
    assert_has(&src, ".downcast_ref::<model::TemplateData>()");
    assert_has(&src, "None => Default::default(),");
    assert_has(&src, "let var0: isize = data.some_int.clone();");
    assert_has(&src, "w.write_all(var0.to_string().as_bytes())");
    assert_has(&src, "use demo::model;");
}

#[test]
fn test_narrow_int_widens_before_formatting() {
    let src = compile("{{.some_int8}}");
    assert_has(&src, "w.write_all(i64::from(var0).to_string().as_bytes())");
}

#[test]
fn test_unsigned_and_float_conversions() {
    let src = compile("{{.some_uint64}}{{.some_float32}}");
    assert_has(&src, "let var0: u64 = data.some_uint64.clone();");
    assert_has(&src, "w.write_all(var0.to_string().as_bytes())");
    assert_has(&src, "let var1: f32 = data.some_float32.clone();");
    assert_has(&src, "w.write_all(var1.to_string().as_bytes())");
}

#[test]
fn test_byte_slice_writes_directly() {
    let src = compile("{{.some_byte_slice}}");
    assert_has(&src, "let var0: Vec<u8> = data.some_byte_slice.clone();");
    assert_has(&src, "w.write_all(&var0)");
}

#[test]
fn test_other_slices_fall_back_to_debug() {
    let src = compile("{{.some_rune_slice}}");
    assert_has(&src, "write!(w, \"{:?}\", var0)");
}

#[test]
fn test_bool_print() {
    let src = compile("{{.some_bool}}");
    assert_has(&src, "\"true\"");
    assert_has(&src, "\"false\"");
}

#[test]
fn test_truth_tests_by_kind() {
    let src = compile(
        "{{if .some_string}}{{end}}\n{{if .some_int}}{{end}}\n{{if .some_bool}}{{end}}\n{{if .some_byte_slice}}{{end}}",
    );
    assert_has(&src, "if !var0.is_empty() {");
    assert_has(&src, "if var1 != 0 {");
    assert_has(&src, "if var2 {");
    assert_has(&src, "if !var3.is_empty() {");
}

#[test]
fn test_literal_if_and_else() {
    let src = compile("{{if true}}a{{else}}b{{end}}");
    assert_has(&src, "if true {");
    assert_has(&src, "} else {");
    assert_has(&src, "static BUILTIN0: &[u8] = b\"a\";");
    assert_has(&src, "static BUILTIN1: &[u8] = b\"b\";");
}

#[test]
fn test_struct_condition_is_always_true() {
    let src = compile("{{with .}}x{{end}}");
    assert_has(&src, "let var0: model::TemplateData = data.clone();");
    assert_has(&src, "if true {");
}

#[test]
fn test_range_with_implicit_iterator() {
    let src = compile("{{range .some_byte_slice}}{{.}}{{end}}");
    assert_has(&src, "let var0: Vec<u8> = data.some_byte_slice.clone();");
    assert_has(&src, "for iterable in var0.clone() {");
    assert_has(&src, "w.write_all(u64::from(iterable).to_string().as_bytes())");
}

#[test]
fn test_range_with_key_and_value() {
    let src = compile("{{range $i, $v := .items}}{{$v}}{{end}}");
    assert_has(
        &src,
        "for (tpl_i, tpl_v) in var0.clone().into_iter().enumerate() {",
    );
    assert_has(&src, "w.write_all(tpl_v.as_bytes())");
}

#[test]
fn test_range_else_checks_emptiness_after_loop() {
    let src = compile("{{range .items}}A{{else}}B{{end}}");
    assert_has(&src, "for iterable in var0.clone() {");
    assert_has(&src, "if var0.is_empty() {");
    assert_has(&src, "static BUILTIN1: &[u8] = b\"B\";");
}

#[test]
fn test_nested_range_shadowing() {
    let src = compile(
        "{{range $i, $v := .friends}}{{range $i, $v := $v.friends}}{{$v}}{{end}}{{end}}",
    );
    assert_has(&src, "let var1: Vec<model::TemplateData> = tpl_v.friends.clone();");
    assert_has(&src, "tpl_i_shadow");
    assert_has(&src, "write!(w, \"{:?}\", tpl_v_shadow)");
}

#[test]
fn test_map_range() {
    let src = compile("{{range $k, $v := .some_map}}{{$v}}{{end}}");
    assert_has(&src, "for (tpl_k, tpl_v) in var0.clone() {");
}

#[test]
fn test_method_calls() {
    let src = compile(r#"{{.method_hello}}{{.method_arg_hello "me"}}"#);
    assert_has(&src, "let var0: String = data.method_hello();");
    assert_has(
        &src,
        "let var1: String = data.method_arg_hello(\"me\".to_string());",
    );
}

#[test]
fn test_fallible_method_unwraps_through_match() {
    let src = compile(r#"{{$x := .method_may_fail "me"}}{{$x}}"#);
    assert_has(&src, "let tpl_x = match data.method_may_fail(\"me\".to_string()) {");
    assert_has(&src, "Ok(v) => v,");
    assert_has(&src, "Err(err) => return Err(err.into()),");
}

#[test]
fn test_variable_method_call() {
    let src = compile("{{$x := .}}{{$x.method_hello}}");
    assert_has(&src, "let tpl_x: model::TemplateData = data.clone();");
    assert_has(&src, "let var0: String = tpl_x.method_hello();");
}

#[test]
fn test_dynamic_helper_dispatch() {
    let mut funcs = Funcs::new();
    funcs.insert("up".to_string(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    let src = tplc::compile(&config(r#"{{up "rr"}}"#, false, funcs, vec![])).unwrap();
    assert_has(&src, ".get_funcs()[\"up\"]");
    assert_has(&src, "fn(String) -> String");
    assert_has(&src, "\"helper up has an unexpected signature\"");
    assert_has(&src, "\"rr\".to_string()");
}

#[test]
fn test_variadic_helper_packs_trailing_vec() {
    let mut funcs = Funcs::new();
    funcs.insert(
        "join".to_string(),
        FnSig {
            ins: vec![Ty::Str, Ty::Str],
            outs: vec![Ty::Str],
            variadic: true,
        },
    );
    let src = tplc::compile(&config(
        r#"{{join "-" "a" "b"}}"#,
        false,
        funcs,
        vec![],
    ))
    .unwrap();
    assert_has(&src, "fn(String, Vec<String>) -> String");
    assert_has(&src, "vec![");
}

#[test]
fn test_public_ident_emits_direct_call() {
    let mut funcs = Funcs::new();
    funcs.insert("up".to_string(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    let src = tplc::compile(&config(
        r#"{{up .some_string}}"#,
        false,
        funcs,
        vec![PublicIdent {
            func_name: "up".to_string(),
            selector: "helpers::up".to_string(),
            pkg_path: "demo::helpers".to_string(),
        }],
    ))
    .unwrap();
    assert_has(&src, "use demo::helpers;");
    assert_has(&src, "helpers::up(data.some_string.clone())");
    assert!(!src.contains("get_funcs"), "dispatch not specialized:\n{src}");
}

#[test]
fn test_len_specializes_to_native_len() {
    let src = compile("{{if ne 0 (len .items)}}x{{end}}");
    assert_has(&src, "let var0: usize = data.items.len();");
    assert_has(&src, "let var1: bool = 0 != var0;");
    assert_has(&src, "if var1 {");
}

#[test]
fn test_eq_folds_as_any_of() {
    let src = compile("{{if eq .some_int 1 2}}x{{end}}");
    assert_has(
        &src,
        "let var0: bool = data.some_int == 1 || data.some_int == 2;",
    );
}

#[test]
fn test_comparison_operators() {
    let src = compile(r#"{{if lt .some_int 4}}x{{end}}{{if eq .some_string "y"}}z{{end}}"#);
    assert_has(&src, "let var0: bool = data.some_int < 4;");
    assert_has(&src, "let var1: bool = data.some_string == \"y\";");
}

#[test]
fn test_not_negates_truthiness() {
    let src = compile("{{if not .some_string}}x{{end}}");
    assert_has(&src, "let var0: bool = !(!data.some_string.is_empty());");
    assert_has(&src, "if var0 {");
}

#[test]
fn test_and_or_chain_booleans() {
    let src = compile("{{if and .some_bool (eq .some_int 1)}}x{{end}}");
    assert_has(&src, "let var0: bool = data.some_int == 1;");
    assert_has(&src, "let var1: bool = data.some_bool && var0;");
}

#[test]
fn test_index_specializes_map_access() {
    let src = compile(r#"{{index .some_map "k"}}"#);
    assert_has(
        &src,
        "let var0: isize = data.some_map.get(\"k\").cloned().unwrap_or_default();",
    );
}

#[test]
fn test_html_escaper_writes_directly() {
    let src = compile("{{html .some_string}}");
    assert_has(
        &src,
        "if let Err(err) = escape::html_escape(w, data.some_string.as_bytes()) {",
    );
    assert_has(&src, "use tplc::escape;");
}

#[test]
fn test_html_mode_escapes_string_prints() {
    let src = tplc::compile(&config("{{.some_string}}", true, Funcs::new(), vec![])).unwrap();
    assert_has(&src, "escape::html_escape(w, var0.as_bytes())");
}

#[test]
fn test_urlquery_uses_escape_library() {
    let src = compile("{{urlquery .some_string}}");
    assert_has(
        &src,
        "let var0: String = escape::url_query_escape(&data.some_string);",
    );
}

#[test]
fn test_define_and_invoke() {
    let mut funcs = Funcs::new();
    funcs.insert("up".to_string(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    let src = tplc::compile(&config(
        r#"{{define "rr"}}what{{end}}ww{{template "rr" (up "rr")}}"#,
        false,
        funcs,
        vec![PublicIdent {
            func_name: "up".to_string(),
            selector: "helpers::up".to_string(),
            pkg_path: "demo::helpers".to_string(),
        }],
    ))
    .unwrap();
    // Two functions, registered under their template names.
    assert_has(&src, "registry.add(\"t.tpl\", fn_t_tpl_0);");
    assert_has(&src, "registry.add(\"rr\", fn_t_tpl_rr_1);");
    // The parent writes its text then dispatches with the inline argument.
    assert_has(&src, "static BUILTIN0: &[u8] = b\"ww\";");
    assert_has(&src, "static BUILTIN1: &[u8] = b\"what\";");
    assert_has(
        &src,
        "t.execute_template(w, \"rr\", &helpers::up(\"rr\".to_string()))",
    );
    // The association block wires the child into the parent.
    assert_has(&src, "let mut tpl0x0 = registry.must_get(\"t.tpl\").clone();");
    assert_has(&src, "let tpl0y0 = registry.must_get(\"rr\").clone();");
    assert_has(&src, "tpl0x0 = tpl0x0.compiled(tpl0y0);");
    assert_has(&src, "registry.set(\"t.tpl\", tpl0x0);");
}

#[test]
fn test_template_invocation_without_argument() {
    let src = compile(r#"{{define "side"}}x{{end}}{{template "side"}}"#);
    assert_has(&src, "t.execute_template(w, \"side\", &())");
}

#[test]
fn test_identical_literals_are_interned_once() {
    let src = compile("ab{{if .some_bool}}ab{{end}}");
    assert_eq!(src.matches("static BUILTIN").count(), 1, "{src}");
}

#[test]
fn test_registry_static_shape() {
    let src = compile("x");
    assert_has(&src, "pub static TEMPLATES: LazyLock<Registry> = LazyLock::new(|| {");
    assert_has(&src, "let mut registry = Registry::new();");
    assert_has(&src, "use tplc::registry::Registry;");
    assert_has(&src, "use std::sync::LazyLock;");
}

#[test]
fn test_funcs_provider_wired_into_init() {
    let mut cfg = config("x", false, Funcs::new(), vec![]);
    cfg.funcs_provider = Some("demo::helpers::template_funcs".to_string());
    let src = tplc::compile(&cfg).unwrap();
    assert_has(
        &src,
        "let mut registry = Registry::new().with_funcs(helpers::template_funcs());",
    );
}

#[test]
fn test_data_module_alias_renamed_on_collision() {
    let mut env = type_env();
    env.register(TypeDef {
        name: "Other".to_string(),
        module: "demo::data".to_string(),
        public: true,
        body: TypeBody::Struct {
            fields: vec![],
            methods: vec![],
        },
    });
    let mut cfg = config("{{.}}", false, Funcs::new(), vec![]);
    cfg.type_env = env;
    cfg.templates[0]
        .data
        .insert("*".to_string(), Ty::Named("demo::data::Other".to_string()));
    let src = tplc::compile(&cfg).unwrap();
    // `data` is a reserved binding, so the import is alias-renamed.
    assert_has(&src, "use demo::data as aliasdata;");
    assert_has(&src, "aliasdata::Other");
}

#[test]
fn test_missing_data_configuration_fails() {
    let mut cfg = config("{{.some_int}}", false, Funcs::new(), vec![]);
    cfg.templates[0].data.clear();
    let err = tplc::compile(&cfg).unwrap_err();
    assert!(matches!(err, CompileError::MissingData { template } if template == "t.tpl"));
}

#[test]
fn test_unknown_helper_fails() {
    let err = tplc::compile(&config("{{mystery 1}}", false, Funcs::new(), vec![])).unwrap_err();
    assert!(matches!(err, CompileError::UnknownHelper { name, .. } if name == "mystery"));
}

#[test]
fn test_unexported_helper_type_fails() {
    let mut env = type_env();
    env.register(TypeDef {
        name: "Hidden".to_string(),
        module: "demo::internal".to_string(),
        public: false,
        body: TypeBody::Struct {
            fields: vec![],
            methods: vec![],
        },
    });
    let mut funcs = Funcs::new();
    funcs.insert(
        "secret".to_string(),
        FnSig::new(
            vec![Ty::Named("demo::internal::Hidden".to_string())],
            vec![Ty::Str],
        ),
    );
    let mut cfg = config("{{$x := .}}{{secret $x}}", false, funcs, vec![]);
    cfg.type_env = env;
    let err = tplc::compile(&cfg).unwrap_err();
    assert!(
        matches!(err, CompileError::UnexportedHelperType { helper, .. } if helper == "secret"),
        "unexpected error"
    );
}

#[test]
fn test_demo_configuration_compiles() {
    let json = std::fs::read_to_string("demos/tplc.json").unwrap();
    let cfg = Configuration::from_json(&json).unwrap();
    let src = tplc::compile(&cfg).unwrap();
    assert_has(&src, "registry.add(\"index.tpl\", fn_index_tpl_0);");
    assert_has(&src, "pub static COMPILED_TEMPLATES: LazyLock<Registry>");
    assert_has(&src, "if var1.is_empty() {");
}

#[test]
fn test_compilation_is_idempotent() {
    let cfg = config(
        "{{range .items}}{{.}}{{else}}none{{end}}{{.some_int}}",
        false,
        Funcs::new(),
        vec![],
    );
    let first = tplc::compile(&cfg).unwrap();
    let second = tplc::compile(&cfg).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_pipeline_chains_stage_through_temporaries() {
    let mut funcs = Funcs::new();
    funcs.insert("up".to_string(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    let src = tplc::compile(&config("{{.some_string | up}}", false, funcs, vec![])).unwrap();
    assert_has(&src, "let var0: String = data.some_string.clone();");
    assert_has(&src, ".get_funcs()[\"up\"]");
    assert_has(&src, "(var0.clone())");
    assert_has(&src, "w.write_all(var1.as_bytes())");
}
