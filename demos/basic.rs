use qq_mongodb::prelude::*;
use serde_json::{json, Value};

struct SendEmail;

#[async_trait]
impl JobHandler for SendEmail {
    async fn execute(&self, job: Job) -> Result<Value, anyhow::Error> {
        println!("sending {} to {}", job.title, job.data["to"]);
        Ok(json!({ "delivered": true }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = QueueConfig::from_env();
    let store = MongoDbStore::new(&config.database_url, config.database_cert_file.clone()).await?;
    let queue = Queue::new(store, config)?;

    let mut events = queue.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    // Fails if MongoDB can't be reached.
    queue.start().await?;
    queue
        .register_job_type(JobType::new("email", SendEmail).max_retry(3).concurrency_limit(2))
        .await?;

    // Queue a job to run now
    queue
        .submit_one(NewJob::new("email").data(json!({ "to": "me@example.com" })))
        .await?;

    // Two workers, one per unit of the concurrency limit.
    let workers = queue.spawn_workers("email").await?;

    // Run briefly, then stop taking new jobs and wait for in-flight ones.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    queue.shutdown();
    workers.join().await;
    Ok(())
}
