use cascadec::ast::Method;
use cascadec::compile::{compile_pattern, PathPattern, RouteTable, Segment};
use cascadec::diag::Diagnostics;
use cascadec::span::Span;

fn table(src: &str) -> RouteTable {
    let (program, diags) = cascadec::parse_source(src);
    assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    let mut diags = Diagnostics::default();
    let table = RouteTable::build(&program, &mut diags);
    assert!(!diags.has_errors(), "unexpected diagnostics: {diags:?}");
    table
}

#[test]
fn compiles_literals_and_params() {
    let mut diags = Diagnostics::default();
    let pattern = compile_pattern("/users/:id/posts", Span::default(), &mut diags);
    assert!(!diags.has_errors());
    assert_eq!(
        pattern,
        PathPattern::Segments(vec![
            Segment::Literal(String::new()),
            Segment::Literal("users".to_string()),
            Segment::Param("id".to_string()),
            Segment::Literal("posts".to_string()),
        ])
    );
}

#[test]
fn star_alone_is_catch_all() {
    let mut diags = Diagnostics::default();
    assert_eq!(
        compile_pattern("*", Span::default(), &mut diags),
        PathPattern::CatchAll
    );
    assert!(!diags.has_errors());
}

#[test]
fn star_inside_a_pattern_is_an_error() {
    let mut diags = Diagnostics::default();
    compile_pattern("/a/*", Span::default(), &mut diags);
    assert!(diags.has_errors());
}

#[test]
fn first_match_wins_in_declared_order() {
    let table = table(
        r#"
[path="/u/me"]:GET { @return json(1); }
[path="/u/:id"]:GET { @return json(2); }
"#,
    );
    let hit = table.lookup(Method::Get, "/u/me").expect("match");
    assert_eq!(hit.route_index, 0);
    assert!(hit.params.is_empty());

    let hit = table.lookup(Method::Get, "/u/42").expect("match");
    assert_eq!(hit.route_index, 1);
    assert_eq!(hit.params.get("id").map(String::as_str), Some("42"));
}

#[test]
fn capture_map_has_exactly_the_param_keys() {
    let table = table(r#"[path="/a/:x/b/:y"]:GET { @return json(1); }"#);
    let hit = table.lookup(Method::Get, "/a/1/b/2").expect("match");
    let mut keys: Vec<&str> = hit.params.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["x", "y"]);
}

#[test]
fn segment_count_must_match_exactly() {
    let table = table(r#"[path="/a/:x"]:GET { @return json(1); }"#);
    assert!(table.lookup(Method::Get, "/a").is_none());
    assert!(table.lookup(Method::Get, "/a/1/2").is_none());
}

#[test]
fn params_do_not_match_empty_segments() {
    let table = table(r#"[path="/a/:x"]:GET { @return json(1); }"#);
    assert!(table.lookup(Method::Get, "/a/").is_none());
}

#[test]
fn literal_segments_compare_after_url_decoding() {
    let table = table(r#"[path="/café"]:GET { @return json(1); }"#);
    assert!(table.lookup(Method::Get, "/caf%C3%A9").is_some());
}

#[test]
fn param_captures_are_url_decoded() {
    let table = table(r#"[path="/u/:id"]:GET { @return json(1); }"#);
    let hit = table.lookup(Method::Get, "/u/a%20b").expect("match");
    assert_eq!(hit.params.get("id").map(String::as_str), Some("a b"));
}

#[test]
fn catch_all_runs_after_explicit_routes_miss() {
    let table = table(
        r#"
[path="/a"]:GET { @return json(1); }
[path="*"]:GET { @return json(2); }
"#,
    );
    let hit = table.lookup(Method::Get, "/a").expect("match");
    assert_eq!(hit.route_index, 0);
    let hit = table.lookup(Method::Get, "/b").expect("match");
    assert_eq!(hit.route_index, 1);
}

#[test]
fn no_match_without_catch_all() {
    let table = table(r#"[path="/a"]:GET { @return json(1); }"#);
    assert!(table.lookup(Method::Get, "/b").is_none());
    assert!(table.lookup(Method::Post, "/a").is_none());
}

#[test]
fn head_falls_back_to_get() {
    let table = table(
        r#"
[path="/a"]:GET { @return json(1); }
[path="/b"]:HEAD { @return json(2); }
"#,
    );
    let hit = table.lookup(Method::Head, "/a").expect("match");
    assert_eq!(hit.route_index, 0);
    assert!(hit.head_fallback);

    let hit = table.lookup(Method::Head, "/b").expect("match");
    assert_eq!(hit.route_index, 1);
    assert!(!hit.head_fallback);
}
