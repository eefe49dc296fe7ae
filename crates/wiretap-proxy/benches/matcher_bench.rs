use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use http::Method;
use url::Url;
use wiretap_proxy::matcher::Matcher;
use wiretap_proxy::request::{Body, Protocol, RequestFingerprint};
use wiretap_proxy::rule::Rule;
use wiretap_proxy::selector::{self, index::RuleIndex};
use wiretap_proxy::step::{FixedResponseStep, Step};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

fn req(path: &str) -> RequestFingerprint {
    RequestFingerprint::new(
        Method::GET,
        Url::parse(&format!("http://localhost{path}")).unwrap(),
        Protocol::Http,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
        vec![],
        false,
        Body::empty(),
    )
}

fn exact_rule(id: usize, seq: u64) -> Arc<Rule> {
    Arc::new(
        Rule::builder()
            .id(format!("rule-{id}"))
            .matcher(Matcher::method(Method::GET))
            .matcher(Matcher::flexible_path(format!("/api/v1/endpoint{id}"), true))
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .build(seq)
            .unwrap(),
    )
}

fn regex_rule(id: usize, seq: u64) -> Arc<Rule> {
    Arc::new(
        Rule::builder()
            .id(format!("rule-{id}"))
            .matcher(Matcher::regex_path(&format!(r"^/api/v\d+/endpoint{id}$")).unwrap())
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .build(seq)
            .unwrap(),
    )
}

fn build_rules(count: usize) -> Vec<Arc<Rule>> {
    (0..count).map(|i| exact_rule(i, i as u64)).collect()
}

fn build_regex_rules(count: usize) -> Vec<Arc<Rule>> {
    (0..count).map(|i| regex_rule(i, i as u64)).collect()
}

fn bench_rule_selection(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rule_selection");

    for rule_count in [10, 50, 100, 500, 1000].iter() {
        let rules = build_rules(*rule_count);
        let index = selector::build_index(&rules);

        group.throughput(Throughput::Elements(1));

        let first = req("/api/v1/endpoint0");
        group.bench_with_input(BenchmarkId::new("select_first", rule_count), rule_count, |b, _| {
            b.iter(|| rt.block_on(selector::select(black_box(&rules), black_box(&index), black_box(&first))));
        });

        let middle_path = format!("/api/v1/endpoint{}", rule_count / 2);
        let middle = req(&middle_path);
        group.bench_with_input(BenchmarkId::new("select_middle", rule_count), rule_count, |b, _| {
            b.iter(|| rt.block_on(selector::select(black_box(&rules), black_box(&index), black_box(&middle))));
        });

        let last_path = format!("/api/v1/endpoint{}", rule_count - 1);
        let last = req(&last_path);
        group.bench_with_input(BenchmarkId::new("select_last", rule_count), rule_count, |b, _| {
            b.iter(|| rt.block_on(selector::select(black_box(&rules), black_box(&index), black_box(&last))));
        });

        let none = req("/not/found");
        group.bench_with_input(BenchmarkId::new("select_none", rule_count), rule_count, |b, _| {
            b.iter(|| rt.block_on(selector::select(black_box(&rules), black_box(&index), black_box(&none))));
        });
    }

    group.finish();
}

fn bench_regex_selection(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("regex_selection");

    for rule_count in [10, 50, 100].iter() {
        let rules = build_regex_rules(*rule_count);
        let index = selector::build_index(&rules);
        let target = req(&format!("/api/v1/endpoint{}", rule_count / 2));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("regex_select", rule_count), rule_count, |b, _| {
            b.iter(|| rt.block_on(selector::select(black_box(&rules), black_box(&index), black_box(&target))));
        });
    }

    group.finish();
}

fn bench_single_rule_match(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("single_rule_match");

    let rule = exact_rule(0, 0);
    let request = req("/api/v1/endpoint0");

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_match", |b| {
        b.iter(|| rt.block_on(rule.matches(black_box(&request))));
    });

    group.finish();
}

fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_index_build");

    for rule_count in [10, 50, 100, 500, 1000].iter() {
        let rules = build_rules(*rule_count);

        group.throughput(Throughput::Elements(*rule_count as u64));
        group.bench_with_input(BenchmarkId::new("build", rule_count), rule_count, |b, _| {
            b.iter(|| {
                let owned: Vec<(usize, &[Matcher])> =
                    rules.iter().enumerate().map(|(i, r)| (i, r.matchers.as_slice())).collect();
                black_box(RuleIndex::build(&owned))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_rule_selection,
    bench_regex_selection,
    bench_single_rule_match,
    bench_index_build,
);
criterion_main!(benches);
