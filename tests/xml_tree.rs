use std::fmt::Write;
use std::time::{Duration, Instant};

use declad::DecladError;
use declad::tree::{Element, ListItem, MapEntry, TreeNode, location};
use declad::xml::{parse_document, write_element};

#[test]
fn parses_nested_elements_with_lines() {
    let text = "<?xml version=\"1.0\"?>\n<Decs>\n  <Weapon decName=\"Sword\">\n    <damage>7</damage>\n  </Weapon>\n</Decs>\n";
    let root = parse_document(text).expect("well formed");
    assert_eq!(root.name, "Decs");
    assert_eq!(root.text, None, "whitespace between children is not text");
    let weapon = root.child("Weapon").expect("weapon child");
    assert_eq!(weapon.attribute("decName"), Some("Sword"));
    assert_eq!(weapon.line, Some(3));
    assert_eq!(weapon.child("damage").and_then(|d| d.text.as_deref()), Some("7"));
    assert_eq!(location("weapons.xml", weapon), "weapons.xml:3");
}

#[test]
fn decodes_entities_and_cdata() {
    let root = parse_document("<a t=\"x &amp; y\"><b>&lt;tag&gt; &#65;&#x42;</b><c><![CDATA[  ]]></c></a>").expect("parse");
    assert_eq!(root.attribute("t"), Some("x & y"));
    assert_eq!(root.child("b").and_then(|b| b.text.as_deref()), Some("<tag> AB"));
    assert_eq!(root.child("c").and_then(|c| c.text.as_deref()), Some("  "), "CDATA keeps whitespace-only text");
}

#[test]
fn rejects_mismatched_close_tag() {
    let err = parse_document("<a><b></a></b>").expect_err("mismatched tags must fail");
    assert!(matches!(err, DecladError::Parse { .. }), "got {err:?}");
}

#[test]
fn rejects_unbalanced_documents() {
    for text in ["<a><b></b>", "<a></a><b></b>", "</a>", "<a></a>tail", ""] {
        let err = parse_document(text).expect_err(text);
        assert!(matches!(err, DecladError::Parse { .. }), "{text}: got {err:?}");
    }
    match parse_document("<a>\n<b>\n</c></a>") {
        Err(DecladError::Parse { message, line, .. }) => {
            assert!(message.contains("closing tag </c> does not match <b>"), "message was {message}");
            assert_eq!(line, Some(2), "points at the unmatched open tag");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn rejects_duplicate_attributes() {
    let err = parse_document("<a x=\"1\" x=\"2\" />").expect_err("duplicate attribute must fail");
    match err {
        DecladError::Parse { message, .. } => assert!(message.contains("duplicate attribute"), "message was {message}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn written_tree_reads_back() {
    let tree = Element::new("root")
        .with_attribute("note", "a \"quoted\"\nvalue")
        .with_child(Element::new("li").with_text("one & two"))
        .with_child(Element::new("li").with_text("   "))
        .with_child(Element::new("empty"));
    for pretty in [true, false] {
        let text = write_element(&tree, pretty);
        let back = parse_document(&text).expect("own output parses");
        assert_eq!(back.attribute("note"), Some("a \"quoted\"\nvalue"));
        let texts: Vec<Option<&str>> = back.children.iter().map(|c| c.text.as_deref()).collect();
        assert_eq!(texts, vec![Some("one & two"), Some("   "), None]);
    }
}

#[test]
fn collection_helpers_classify_children() {
    let root = parse_document("<m><li><key>a</key><value>1</value></li><b>2</b></m>").expect("parse");
    let entries = root.map_entries();
    assert_eq!(entries.len(), 2);
    assert!(matches!(entries[0], MapEntry::Explicit { key: Some(_), value: Some(_), .. }));
    assert!(matches!(entries[1], MapEntry::Inline { key: "b", .. }));

    let items = root.list_items();
    assert!(matches!(items[0], ListItem::Item(_)));
    assert!(matches!(items[1], ListItem::Misnamed(_)), "non-li children are flagged");
    assert_eq!(root.unrecognized_attribute_names(&["null"]), Vec::<&str>::new());
}

#[test]
fn wide_documents_parse_in_linear_time() {
    let mut text = String::from("<list>");
    for i in 0..20_000 {
        write!(text, "\n<li>{i}</li>").expect("write to string");
    }
    text.push_str("\n</list>");

    let started = Instant::now();
    let root = parse_document(&text).expect("parse");
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(root.children.len(), 20_000);
    let last = root.children.last().expect("last item");
    assert_eq!(last.line, Some(20_001));
    assert_eq!(last.text.as_deref(), Some("19999"));
}

#[test]
fn deep_documents_parse_without_recursion() {
    let depth = 10_000;
    let text = format!("{}{}", "<n>".repeat(depth), "</n>".repeat(depth));
    let root = parse_document(&text).expect("parse");

    let mut levels = 1;
    let mut current = &root;
    while let Some(child) = current.children.first() {
        assert_eq!(child.name, "n");
        levels += 1;
        current = child;
    }
    assert_eq!(levels, depth);
}
