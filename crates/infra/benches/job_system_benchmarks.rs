use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use msaq_core::{JobRequest, StaticCatalog, normalize_query};
use msaq_infra::jobs::{JobSystem, LocalJobSystem, StatusUpdate};

fn request(i: usize) -> JobRequest {
    let catalog = StaticCatalog::new(["uniref", "bfd"]);
    let query: String = "ACDEFGHIKLMNPQRSTVWY"
        .chars()
        .cycle()
        .skip(i % 20)
        .take(64 + i % 50)
        .collect();
    JobRequest::msa(&query, &["uniref".to_string()], &catalog, &format!("standard-{i}"), None)
        .unwrap()
}

fn bench_request_construction(c: &mut Criterion) {
    let catalog = StaticCatalog::new(["uniref", "bfd", "pdb70"]);
    let fasta = format!(">query\n{}\n", "acdefghiklmnpqrstvwy ".repeat(50));

    let mut group = c.benchmark_group("request");
    group.throughput(Throughput::Bytes(fasta.len() as u64));
    group.bench_function("normalize_query", |b| {
        b.iter(|| normalize_query(black_box(&fasta)).unwrap())
    });
    group.bench_function("msa_with_fingerprint", |b| {
        b.iter(|| {
            JobRequest::msa(
                black_box(&fasta),
                &["uniref".to_string(), "bfd".to_string()],
                &catalog,
                "standard",
                None,
            )
            .unwrap()
        })
    });
    group.finish();
}

fn bench_submit_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_job_system");

    for &jobs_count in &[10usize, 100] {
        let requests: Vec<JobRequest> = (0..jobs_count).map(request).collect();
        group.throughput(Throughput::Elements(jobs_count as u64));

        group.bench_with_input(
            BenchmarkId::new("submit_claim_complete", jobs_count),
            &requests,
            |b, requests| {
                b.iter(|| {
                    let dir = tempfile::tempdir().unwrap();
                    let jobs = LocalJobSystem::open(dir.path()).unwrap();
                    for r in requests {
                        jobs.submit(r, dir.path(), false).unwrap();
                    }
                    while let Some(job) = jobs.claim(Duration::ZERO).unwrap() {
                        let location = job.work_dir.join("result.tar.gz");
                        jobs.update_status(job.ticket, StatusUpdate::complete(location))
                            .unwrap();
                    }
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("concurrent_claim_4_threads", jobs_count),
            &requests,
            |b, requests| {
                b.iter(|| {
                    let dir = tempfile::tempdir().unwrap();
                    let jobs = Arc::new(LocalJobSystem::open(dir.path()).unwrap());
                    for r in requests {
                        jobs.submit(r, dir.path(), false).unwrap();
                    }
                    let handles: Vec<_> = (0..4)
                        .map(|_| {
                            let jobs = Arc::clone(&jobs);
                            thread::spawn(move || {
                                let mut claimed = 0usize;
                                while jobs.claim(Duration::ZERO).unwrap().is_some() {
                                    claimed += 1;
                                }
                                claimed
                            })
                        })
                        .collect();
                    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
                    assert_eq!(total, requests.len());
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_request_construction, bench_submit_claim);
criterion_main!(benches);
