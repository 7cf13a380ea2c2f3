//! Trailhead club demo
//!
//! Runs a scripted day in the life of the club against the in-memory
//! store:
//! - members join a hike with two spots, the third lands on the waitlist
//! - one member leaves, the next joiner gets the freed spot
//! - on hike day an admin scans badges and applies the verification
//!
//! # Usage
//!
//! ```bash
//! TRAILHEAD_LOG=trailhead=debug cargo run --bin trailhead-demo
//! ```

use anyhow::Context;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use trailhead_club::{
    metrics::register_business_metrics,
    verification::{CaptureSupervisor, ManualCamera},
    ActorContext, Config, EnrollmentEngine, EnrollmentEnvironment, Hike, HikeId, InMemoryClubStore,
    Profile, Role, UserId, VerificationEnvironment, VerificationWorkflow,
};
use trailhead_core::environment::SystemClock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn member(store: &InMemoryClubStore, name: &str) -> UserId {
    let user_id = UserId::new();
    store.add_profile(Profile {
        user_id,
        full_name: Some(name.to_string()),
        email: Some(format!("{}@trailhead.example", name.to_lowercase())),
        avatar_url: None,
    });
    user_id
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    register_business_metrics();

    println!("\n============================================");
    println!("   Trailhead Club - Live Demo");
    println!("============================================\n");

    let store = InMemoryClubStore::new();
    let clock = Arc::new(SystemClock);
    let hike_id = HikeId::new();
    let admin = member(&store, "Morgan");
    store.grant(admin, Role::Admin);
    store.add_hike(Hike {
        id: hike_id,
        name: "Ridge Loop".to_string(),
        description: Some("Sunrise loop over the north ridge".to_string()),
        date: Utc::now().date_naive(),
        end_date: None,
        difficulty: "moderate".to_string(),
        distance_km: 14.5,
        elevation_m: 820,
        duration: "5h".to_string(),
        location_name: "North trailhead car park".to_string(),
        location_lat: 46.55,
        location_lng: 7.98,
        max_participants: 2,
        organizer_id: Some(admin),
        organizer_name: "Morgan".to_string(),
    });

    // ========== Enrollment ==========

    let engine = EnrollmentEngine::new(
        EnrollmentEnvironment::new(clock.clone(), Arc::new(store.clone()), Arc::new(store.clone())),
        &config.enrollment,
    );

    println!("1. Members join Ridge Loop (2 spots)");
    let mut members = Vec::new();
    for name in ["Alex", "Blair", "Casey"] {
        let user_id = member(&store, name);
        let status = engine
            .enroll(&ActorContext::member(user_id), hike_id, 2)
            .await
            .with_context(|| format!("{name} could not join"))?;
        println!("   {name:<6} -> {status}");
        members.push(user_id);
    }

    println!("\n2. Blair leaves; Drew joins");
    engine.unenroll(&ActorContext::member(members[1]), hike_id).await?;
    let drew = member(&store, "Drew");
    let status = engine.enroll(&ActorContext::member(drew), hike_id, 2).await?;
    println!("   Drew   -> {status}");

    let overview = engine.hike_overview(hike_id).await?;
    println!(
        "   {} enrolled, {} spots left, hike is {:?}",
        overview.enrolled, overview.spots_left, overview.status
    );

    // ========== Verification ==========

    println!("\n3. Hike day: Morgan scans badges");
    let camera = ManualCamera::new();
    let workflow = VerificationWorkflow::new(VerificationEnvironment::new(
        clock,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        CaptureSupervisor::new(Arc::new(camera.clone())),
        config.verification.clone(),
    ));
    workflow.open(&ActorContext::admin(admin), hike_id, 2).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let walk_in = member(&store, "Emery");
    for payload in [members[0].to_string(), "https://not-a-badge".to_string(), walk_in.to_string()] {
        camera.show_text(payload);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(feedback) = workflow.summary().await.and_then(|s| s.feedback) {
            println!("   scan: {}", feedback.message());
        }
    }
    let signal = workflow.on_scan(drew.to_string()).await?;
    println!("   scan: {}", signal.message());

    if let Some(summary) = workflow.summary().await {
        println!(
            "   {} scanned ({} walk-ins), {} still to verify",
            summary.total_scanned, summary.newly_enrolled, summary.not_verified_yet
        );
    }

    let report = workflow.apply().await?;
    println!("   applied: {} members verified", report.verified);

    println!("\n4. Final roster");
    for participant in engine.participants(hike_id).await? {
        let name = participant
            .profile
            .as_ref()
            .map_or("(no profile)", Profile::display_name);
        println!("   {name:<6} {}", participant.enrollment.status);
    }

    workflow.shutdown(Duration::from_secs(5)).await?;
    engine.shutdown(Duration::from_secs(5)).await?;

    println!("\n5. Metrics\n");
    println!("{}", prometheus.render());
    Ok(())
}
