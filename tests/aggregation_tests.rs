/// Integration tests for keyed aggregation, zero-fill and region splitting.
mod common;

use common::{World, node_version, square, times, ts};
use geo::EuclideanLength;
use geo_types::Geometry;
use osh_engine::prelude::*;
use std::collections::BTreeMap;

fn length(geometry: Option<&Geometry<f64>>) -> f64 {
    match geometry {
        Some(Geometry::LineString(line)) => line.euclidean_length(),
        Some(Geometry::MultiLineString(lines)) => lines.euclidean_length(),
        _ => 0.0,
    }
}

#[test]
fn test_every_requested_timestamp_is_zero_filled() {
    let world = World::new();
    let engine = world.sequential();
    let requested = times(&[10, 20, 30, 40, 50, 60]);

    let counts = engine
        .snapshot_view()
        .timestamps(requested.clone())
        .aggregate_by_timestamp()
        .count()
        .unwrap();
    assert_eq!(counts.len(), requested.len());
    assert!(counts.values().all(|n| *n == 0));
    assert!(counts.keys().copied().eq(requested.iter()));
}

#[test]
fn test_combined_index_is_cartesian_after_zero_fill() {
    let mut world = World::new();
    let bakery = world.tag("shop", "bakery");
    let butcher = world.tag("shop", "butcher");
    world.node(1, 15, 1.0, 1.0, &[bakery]);
    world.node(2, 25, 1.0, 1.0, &[bakery]);
    world.node(3, 25, 1.0, 1.0, &[butcher]);
    let shop_key = world.tags.key_id("shop").unwrap();
    let engine = world.sequential();

    let counts = engine
        .snapshot_view()
        .timestamps(times(&[10, 20, 30]))
        .where_key("shop")
        .aggregate_by_timestamp()
        .aggregate_by_zerofill(
            move |s: &Snapshot| s.version().tag_value(shop_key).unwrap_or(-1),
            [bakery.value, butcher.value],
        )
        .count()
        .unwrap();
    assert_eq!(counts.len(), 6);
    assert_eq!(counts[&CombinedIndex::new(ts(10), bakery.value)], 0);
    assert_eq!(counts[&CombinedIndex::new(ts(20), bakery.value)], 1);
    assert_eq!(counts[&CombinedIndex::new(ts(30), bakery.value)], 2);
    assert_eq!(counts[&CombinedIndex::new(ts(30), butcher.value)], 1);

    let nested = nest(counts);
    assert_eq!(nested.len(), 3);
    assert_eq!(nested[&ts(20)][&butcher.value], 0);
    assert!(nested.values().all(|inner| inner.len() == 2));
}

#[test]
fn test_aggregate_by_custom_key_without_zero_fill() {
    let world = World::new();
    for id in 1..=6 {
        world.node(id, 10, id as f64, 0.0, &[]);
    }
    let engine = world.parallel();

    let by_parity = engine
        .snapshot_view()
        .timestamps(times(&[20]))
        .aggregate_by(|s: &Snapshot| s.entity().id() % 2 == 0)
        .map(|s: Snapshot| s.entity().id())
        .collect()
        .unwrap();
    let mut even = by_parity[&true].clone();
    even.sort_unstable();
    assert_eq!(even, vec![2, 4, 6]);
    assert_eq!(by_parity[&false].len(), 3);
}

#[test]
fn test_filter_on_aggregator_keeps_zero_filled_keys() {
    let world = World::new();
    world.node(1, 10, 1.0, 1.0, &[]);
    let engine = world.sequential();

    let counts = engine
        .snapshot_view()
        .timestamps(times(&[20, 30]))
        .aggregate_by_timestamp()
        .filter(|s: &Snapshot| s.entity().id() > 100)
        .count()
        .unwrap();
    assert_eq!(counts, BTreeMap::from([(ts(20), 0), (ts(30), 0)]));
}

#[test]
fn test_reducers_per_key() {
    let world = World::new();
    for (id, lon) in [(1, 1.0), (2, 3.0), (3, 10.0)] {
        world.node(id, 10, lon, 0.0, &[]);
    }
    let engine = world.sequential();
    let longitudes = engine
        .snapshot_view()
        .timestamps(times(&[5, 20]))
        .aggregate_by_timestamp()
        .map(|s: Snapshot| s.version().coordinates().map(|(lon, _)| lon).unwrap_or(0.0));

    let sums = longitudes.sum().unwrap();
    assert_eq!(sums[&ts(5)], 0.0);
    assert!((sums[&ts(20)] - 14.0).abs() < 1e-9);

    let means = longitudes.average().unwrap();
    assert!(means[&ts(5)].is_nan());
    assert!((means[&ts(20)] - 14.0 / 3.0).abs() < 1e-9);

    let medians = longitudes.estimated_quantiles(&[0.0, 1.0]).unwrap();
    assert!(medians[&ts(5)].iter().all(|q| q.is_nan()));
    assert_eq!(medians[&ts(20)].len(), 2);
}

#[test]
fn test_contributions_are_floored_to_requested_timestamps() {
    let mut world = World::new();
    let amenity = world.tag("amenity", "bench");
    world.node(1, 15, 1.0, 1.0, &[amenity]);
    world.node(2, 35, 1.0, 1.0, &[amenity]);
    world.node(3, 40, 1.0, 1.0, &[amenity]);
    let engine = world.sequential();

    let counts = engine
        .contribution_view()
        .timestamps(times(&[10, 30, 40]))
        .aggregate_by_timestamp()
        .count()
        .unwrap();
    let counts: Vec<(i64, u64)> = counts
        .into_iter()
        .map(|(t, n)| (t.epoch_seconds(), n))
        .collect();
    assert_eq!(counts, vec![(10, 1), (30, 1), (40, 1)]);
}

#[test]
fn test_geometry_aggregation_splits_into_regions() {
    let world = World::new();
    world.node(1, 10, 0.5, 0.5, &[]);
    world.node(2, 10, 1.5, 0.5, &[]);
    world.node(3, 10, 1.2, 0.2, &[]);
    world.node(4, 10, 5.0, 5.0, &[]);
    let engine = world.parallel();

    let counts = engine
        .snapshot_view()
        .timestamps(times(&[20]))
        .aggregate_by_geometry([
            ("a", square(0.0, 0.0, 1.0)),
            ("b", square(1.0, 0.0, 1.0)),
            ("c", square(10.0, 10.0, 1.0)),
        ])
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(counts, BTreeMap::from([("a", 1), ("b", 2), ("c", 0)]));
}

#[test]
fn test_split_lengths_sum_to_the_whole() {
    let mut world = World::new();
    let highway = world.tag("highway", "residential");
    world.node(1, 10, 0.5, 0.5, &[]);
    world.node(2, 10, 1.5, 0.5, &[]);
    world.way(10, 10, &[1, 2], &[highway]);
    let engine = world.sequential();

    let lengths = engine
        .snapshot_view()
        .timestamps(times(&[20]))
        .where_key("highway")
        .aggregate_by_geometry([(1, square(0.0, 0.0, 1.0)), (2, square(1.0, 0.0, 1.0))])
        .unwrap()
        .map(|s: Snapshot| length(s.geometry()))
        .sum()
        .unwrap();
    assert!((lengths[&1] - 0.5).abs() < 1e-9);
    assert!((lengths[&2] - 0.5).abs() < 1e-9);
}

#[test]
fn test_geometry_aggregation_combines_with_timestamps() {
    let world = World::new();
    world.node(1, 15, 0.5, 0.5, &[]);
    let engine = world.sequential();

    let counts = engine
        .snapshot_view()
        .timestamps(times(&[10, 20]))
        .aggregate_by_geometry([("a", square(0.0, 0.0, 1.0)), ("b", square(2.0, 0.0, 1.0))])
        .unwrap()
        .aggregate_by_timestamp()
        .count()
        .unwrap();
    assert_eq!(counts.len(), 4);
    assert_eq!(counts[&CombinedIndex::new("a", ts(20))], 1);
    assert_eq!(counts.values().sum::<u64>(), 1);
}

#[test]
fn test_geometry_aggregation_after_transform_is_rejected() {
    let world = World::new();
    let engine = world.sequential();

    let after_filter = engine
        .snapshot_view()
        .filter(|s: &Snapshot| s.version().visible)
        .aggregate_by_geometry([("a", square(0.0, 0.0, 1.0))]);
    assert!(matches!(after_filter, Err(EngineError::InvalidConfiguration { .. })));

    let after_map = engine
        .snapshot_view()
        .aggregate_by_timestamp()
        .map(|s: Snapshot| s)
        .aggregate_by_geometry([("a", square(0.0, 0.0, 1.0))]);
    assert!(after_map.is_err());

    let empty = engine
        .snapshot_view()
        .aggregate_by_geometry(Vec::<(&str, geo_types::Polygon<f64>)>::new());
    assert!(empty.is_err());
}

#[test]
fn test_entity_inside_one_region_keeps_its_geometry() {
    let mut world = World::new();
    let building = world.tag("building", "yes");
    world.square_way(10, 1, 10, 1.0, 1.0, 1.0, &[building]);
    world.square_way(20, 5, 10, 5.5, 0.5, 1.0, &[building]);
    let engine = world.sequential();
    let view = engine
        .snapshot_view()
        .timestamps(times(&[20]))
        .where_key("building");

    let unsplit: Vec<Geometry<f64>> = view
        .map(|s: Snapshot| s.geometry().cloned())
        .collect()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    let by_region = view
        .aggregate_by_geometry([("a", square(0.0, 0.0, 4.0)), ("b", square(5.0, 0.0, 4.0))])
        .unwrap()
        .map(|s: Snapshot| s.geometry().cloned())
        .collect()
        .unwrap();

    assert_eq!(by_region["a"], vec![Some(unsplit[0].clone())]);
    assert_eq!(by_region["b"], vec![Some(unsplit[1].clone())]);
}

#[test]
fn test_contributions_split_by_region() {
    let world = World::new();
    world.insert(
        OsmType::Node,
        1,
        vec![
            node_version(10, 1, 0.5, 0.5),
            node_version(20, 2, 1.5, 0.5),
        ],
    );
    let engine = world.sequential();

    let by_region = engine
        .contribution_view()
        .timestamps(times(&[0, 30]))
        .aggregate_by_geometry([("a", square(0.0, 0.0, 1.0)), ("b", square(1.0, 0.0, 1.0))])
        .unwrap()
        .map(|c: Contribution| {
            (
                c.timestamp().epoch_seconds(),
                c.geometry_before().is_some(),
                c.geometry_after().is_some(),
            )
        })
        .collect()
        .unwrap();

    // Moving out of a region reads as a deletion there, as a creation in
    // the region it moves into.
    assert_eq!(by_region["a"], vec![(10, false, true), (20, true, false)]);
    assert_eq!(by_region["b"], vec![(20, false, true)]);
}

#[test]
fn test_entity_groups_split_element_wise() {
    let world = World::new();
    world.insert(
        OsmType::Node,
        1,
        vec![
            node_version(5, 1, 0.5, 0.5),
            node_version(15, 2, 1.5, 0.5),
        ],
    );
    world.node(2, 5, 0.2, 0.7, &[]);
    let engine = world.sequential();

    let by_region = engine
        .snapshot_view()
        .timestamps(times(&[10, 20]))
        .group_by_entity()
        .unwrap()
        .aggregate_by_geometry([("a", square(0.0, 0.0, 1.0)), ("b", square(1.0, 0.0, 1.0))])
        .unwrap()
        .map(|group: Vec<Snapshot>| {
            group
                .iter()
                .map(|s| (s.entity().id(), s.timestamp().epoch_seconds()))
                .collect::<Vec<_>>()
        })
        .collect()
        .unwrap();

    assert_eq!(
        by_region["a"],
        vec![vec![(1, 10)], vec![(2, 10), (2, 20)]]
    );
    assert_eq!(by_region["b"], vec![vec![(1, 20)]]);
}
