use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::{Map, json};
use stockflow_automation::{AutomationRule, ConditionOperator, FieldCondition, RuleSnapshot, TriggerConditions};
use stockflow_core::{EntityId, LocationId, ProductId, UserId};
use stockflow_events::{TriggerEvent, TriggerType};
use stockflow_inventory::{AllocationStrategy, InventoryItem, plan_reservation};

const ENTITIES: [&str; 4] = ["sales_orders", "sales_order_line_items", "purchase_orders", "inventory_items"];

/// `count` active rules spread over four entities and all trigger types;
/// every other rule carries a status condition.
fn rules(count: usize) -> Vec<AutomationRule> {
    let triggers = [TriggerType::OnCreate, TriggerType::OnUpdate, TriggerType::OnDelete];
    (0..count)
        .map(|i| {
            let rule = AutomationRule::new(
                format!("rule-{i}"),
                ENTITIES[i % ENTITIES.len()],
                triggers[i % triggers.len()],
                UserId::new(),
            );
            if i % 2 == 0 {
                rule.with_conditions(TriggerConditions::new(vec![FieldCondition::new(
                    "status",
                    ConditionOperator::Equals,
                    json!("confirmed"),
                )]))
            } else {
                rule
            }
        })
        .collect()
}

fn order_event() -> TriggerEvent {
    let mut raw = Map::new();
    raw.insert("status".into(), json!("confirmed"));
    raw.insert("total".into(), json!(1250));
    TriggerEvent::created("sales_orders", EntityId::new(), raw, UserId::new())
}

fn bench_rule_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_matching");
    let event = order_event();

    for count in [10usize, 100, 1_000, 10_000] {
        let snapshot = RuleSnapshot::build(rules(count));
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("matching", count), &snapshot, |b, snapshot| {
            b.iter(|| black_box(snapshot.matching(black_box(&event))));
        });
    }

    group.bench_function("snapshot_build_1000", |b| {
        b.iter_batched(
            || rules(1_000),
            |rules| black_box(RuleSnapshot::build(rules)),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn stock_rows(count: usize) -> Vec<InventoryItem> {
    let product = ProductId::new();
    (0..count)
        .map(|i| InventoryItem::new(product, LocationId::new(), 5 + (i as i64 % 20)).unwrap())
        .collect()
}

fn bench_reservation_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservation_planning");

    for rows in [1usize, 10, 100, 1_000] {
        let items = stock_rows(rows);
        let requested = (rows as i64 * 8).max(1);
        group.throughput(Throughput::Elements(rows as u64));

        for strategy in [AllocationStrategy::Fifo, AllocationStrategy::Lifo] {
            group.bench_with_input(
                BenchmarkId::new(format!("order_and_plan_{strategy}"), rows),
                &items,
                |b, items| {
                    b.iter_batched(
                        || items.clone(),
                        |mut candidates| {
                            strategy.order_candidates(&mut candidates).unwrap();
                            black_box(plan_reservation(&candidates, requested, true).unwrap())
                        },
                        criterion::BatchSize::SmallInput,
                    );
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_rule_matching, bench_reservation_planning);
criterion_main!(benches);
