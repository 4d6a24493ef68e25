use std::sync::Arc;

use ossature::bones::{ClientData, Configure, NumericBone, StringBone};
use ossature::datatype::Value;
use ossature::engine::Database;
use ossature::persist::{PersistenceMode, Query};
use ossature::registry::SkeletonRegistry;
use ossature::render::{json, serialize_xml, JsonRender, Renderer, XmlRender};
use ossature::skeleton::{SkeletonBuilder, SkeletonDefinition};

fn database() -> Database {
    Database::new(PersistenceMode::InMemory)
        .unwrap()
        .with_registry(Arc::new(SkeletonRegistry::new()))
}

fn city() -> Arc<SkeletonDefinition> {
    SkeletonBuilder::new("city")
        .bone("name", StringBone::new("Name").required())
        .bone("population", NumericBone::new("Population"))
        .build()
        .unwrap()
}

#[test]
fn structure_lists_bones_in_order() {
    let skel = city().instance();
    let structure = json::render_structure(&skel);
    let entries = structure.as_array().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e[0].as_str().unwrap()).collect();
    assert_eq!(names, vec!["id", "creationdate", "changedate", "name", "population"]);
    let name = &entries[3][1];
    assert_eq!(name["type"], "str");
    assert_eq!(name["descr"], "Name");
    assert_eq!(name["required"], true);
    assert_eq!(name["multiple"], false);
    assert_eq!(entries[0][1]["visible"], false);
}

#[test]
fn view_contains_values_errors_and_action() {
    let mut skel = city().instance();
    assert!(!skel.from_client(&ClientData::new().with("population", "lots")));
    let rendered: serde_json::Value =
        serde_json::from_str(&JsonRender.add(&skel).unwrap()).unwrap();
    assert_eq!(rendered["action"], "add");
    assert_eq!(rendered["values"]["name"], "");
    let errors = rendered["errors"].as_array().unwrap();
    let fields: Vec<&str> = errors
        .iter()
        .map(|e| e["fieldPath"][0].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"name"));
    assert!(fields.contains(&"population"));
    let population = errors
        .iter()
        .find(|e| e["fieldPath"][0] == "population")
        .unwrap();
    assert_eq!(population["severity"], 3);
    assert_eq!(population["errorMessage"], "Invalid number entered");
}

#[test]
fn list_carries_cursor_only_when_more_exists() {
    let db = database();
    let definition = city();
    for (name, population) in [("Graz", 290_000), ("Linz", 210_000), ("Wels", 62_000)] {
        let mut skel = definition.instance();
        skel.set_value("name", name).unwrap();
        skel.set_value("population", Value::Int(population)).unwrap();
        db.save(&mut skel, false).unwrap();
    }
    let query = Query::new("city");
    let first = db.list(&definition, &query, 2, None).unwrap();
    let rendered: serde_json::Value =
        serde_json::from_str(&JsonRender.list(&first, "list").unwrap()).unwrap();
    assert_eq!(rendered["skellist"].as_array().unwrap().len(), 2);
    assert!(rendered["cursor"].is_string());
    assert!(rendered["structure"].is_array());

    let rest = db.list(&definition, &query, 2, first.cursor()).unwrap();
    let rendered = json::list(&rest, "list");
    assert_eq!(rendered["skellist"].as_array().unwrap().len(), 1);
    assert!(rendered["cursor"].is_null());
}

#[test]
fn empty_list_has_no_structure() {
    let db = database();
    let definition = city();
    let list = db.list(&definition, &Query::new("city"), 10, None).unwrap();
    let rendered = json::list(&list, "list");
    assert!(rendered["structure"].is_null());
    assert_eq!(rendered["skellist"], serde_json::json!([]));
}

#[test]
fn xml_mirrors_the_json_view() {
    let mut skel = city().instance();
    skel.set_value("name", "Wien & Umgebung").unwrap();
    skel.set_value("population", Value::Int(1_900_000)).unwrap();
    let xml = XmlRender.view(&skel, "view").unwrap();
    assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(xml.contains("<name ViurDataType=\"string\">Wien &amp; Umgebung</name>"));
    assert!(xml.contains("<population ViurDataType=\"numeric\">1900000</population>"));
    assert!(xml.contains("<id ViurDataType=\"string\"></id>"));
}

#[test]
fn xml_serializes_arbitrary_json() {
    let xml = serialize_xml(&serde_json::json!({"list": [], "nested": {"a.b": false}}));
    assert!(xml.contains("<list ViurDataType=\"list\"/>"));
    assert!(xml.contains("<a_b ViurDataType=\"boolean\">false</a_b>"));
}
