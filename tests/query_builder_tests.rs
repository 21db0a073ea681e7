/// Query condition builder tests
///
/// The builder is pure: these tests never touch storage.
/// Run with: cargo test --test query_builder_tests

use chrono::{Duration, TimeZone, Utc};
use feedback_dal::query::Pagination;
use feedback_dal::{
    Association, DbError, Direction, Predicate, QueryConditionBuilder, Value, feedback_model,
    user_model,
};
use std::sync::Arc;

#[test]
fn test_filter_by_in_last_write_wins() {
    let mut builder = QueryConditionBuilder::new();
    builder
        .filter_by_in("status", vec!["open".into(), "planned".into()])
        .filter_by_in("status", vec!["done".into()]);

    let query = builder.get_query();
    assert_eq!(query.predicates().len(), 1);
    assert_eq!(
        query.predicate_for("status"),
        Some(&Predicate::In {
            field: "status".into(),
            values: vec![Value::from("done")],
        })
    );
}

#[test]
fn test_different_predicate_kinds_on_one_field_replace_each_other() {
    let mut builder = QueryConditionBuilder::new();
    builder.filter_by_eq("title", "exact");
    builder.search_by_field("title", "slow").unwrap();

    let query = builder.get_query();
    assert_eq!(query.predicates().len(), 1);
    assert!(matches!(
        query.predicate_for("title"),
        Some(Predicate::Search { term, .. }) if term == "slow"
    ));
}

#[test]
fn test_organization_scope() {
    let mut builder = QueryConditionBuilder::new();
    builder.filter_by_organization("org-1").filter_by_organization("org-2");

    let query = builder.get_query();
    assert_eq!(query.organization_scope(), Some(&Value::from("org-2")));
    assert_eq!(query.user_scope(), None);
}

#[test]
fn test_custom_scope_fields() {
    let mut builder = QueryConditionBuilder::new().with_scope_fields("tenant", "owner");
    builder.filter_by_organization("t-1").filter_by_user("u-9");

    let query = builder.get_query();
    assert!(query.predicate_for("tenant").is_some());
    assert!(query.predicate_for("owner").is_some());
    assert_eq!(query.user_scope(), Some(&Value::from("u-9")));
}

#[test]
fn test_pagination_is_clamped_and_validated() {
    let mut builder = QueryConditionBuilder::new().with_max_page_size(50);
    builder.add_pagination(3, 500).unwrap();
    assert_eq!(
        builder.get_query().pagination(),
        Some(Pagination { page: 3, size: 50 })
    );
    assert_eq!(builder.get_query().pagination().unwrap().offset(), 100);

    assert!(matches!(
        builder.add_pagination(0, 10),
        Err(DbError::Validation(_))
    ));
    assert!(matches!(
        builder.add_pagination(1, 0),
        Err(DbError::Validation(_))
    ));
}

#[test]
fn test_default_max_page_size_is_100() {
    let mut builder = QueryConditionBuilder::new();
    builder.add_pagination(1, 10_000).unwrap();
    assert_eq!(builder.get_query().pagination().unwrap().size, 100);
}

#[test]
fn test_order_by_direction() {
    let mut builder = QueryConditionBuilder::new();
    builder
        .add_order_by("created_at", "desc")
        .unwrap()
        .add_order_by("votes", "ASC")
        .unwrap();

    let query = builder.get_query();
    assert_eq!(query.order().len(), 2);
    assert_eq!(query.order()[0].direction, Direction::Desc);
    assert_eq!(query.order()[1].direction, Direction::Asc);

    let err = builder.add_order_by("votes", "SIDEWAYS").unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
    // Rejected input leaves the builder untouched
    assert_eq!(builder.get_query().order().len(), 2);
}

#[test]
fn test_reordering_same_field_replaces_entry() {
    let mut builder = QueryConditionBuilder::new();
    builder.add_order_by("votes", "ASC").unwrap();
    builder.add_order_by("votes", "DESC").unwrap();

    let query = builder.get_query();
    assert_eq!(query.order().len(), 1);
    assert_eq!(query.order()[0].direction, Direction::Desc);
}

#[test]
fn test_date_range_validation() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = start + Duration::days(30);

    let mut builder = QueryConditionBuilder::new();
    builder.add_date_range("created_at", Some(start), Some(end)).unwrap();
    builder.add_date_range("updated_at", None, Some(end)).unwrap();
    assert_eq!(builder.get_query().predicates().len(), 2);

    assert!(builder.add_date_range("created_at", None, None).is_err());
    assert!(builder.add_date_range("created_at", Some(end), Some(start)).is_err());
}

#[test]
fn test_blank_search_term_rejected() {
    let mut builder = QueryConditionBuilder::new();
    assert!(matches!(
        builder.search_by_field("title", "   "),
        Err(DbError::Validation(_))
    ));
    assert!(builder.get_query().predicates().is_empty());
}

#[test]
fn test_includes_deduplicated_by_name() {
    let users = Arc::new(user_model());
    let feedback = Arc::new(feedback_model());

    let mut builder = QueryConditionBuilder::new();
    builder
        .add_include(Association::belongs_to("author", Arc::clone(&users), "user_id"))
        .add_include(Association::has_many("items", Arc::clone(&feedback), "user_id"))
        .add_include(Association::belongs_to("author", users, "user_id"));

    let query = builder.get_query();
    let names: Vec<&str> = query.includes().iter().map(|a| a.name()).collect();
    assert_eq!(names, vec!["author", "items"]);
}

#[test]
fn test_builder_reusable_after_get_query() {
    let mut builder = QueryConditionBuilder::new();
    builder.filter_by_organization("org-1");
    let first = builder.get_query();

    builder.filter_by_in("status", vec!["open".into()]);
    let second = builder.get_query();

    assert_eq!(first.predicates().len(), 1);
    assert_eq!(second.predicates().len(), 2);
    assert_eq!(builder.get_query(), second);
}
