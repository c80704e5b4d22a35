//! Shared LocalStack fixtures for the SNS/SQS contract tests.
//!
//! One container serves every test in the binary; each test provisions its
//! own uniquely named topic and queues inside it.

use std::time::Duration;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_sqs::types::QueueAttributeName;
use backon::Retryable;
use fanout_worker::gateway::{SnsSqsConfig, SnsSqsGateway};
use fanout_worker::utils::retry::connection_backoff;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tokio::sync::OnceCell;

const REGION: &str = "us-east-1";
const LOCALSTACK_PORT: u16 = 4566;

/// Running LocalStack container. Dropping it stops the container.
pub struct LocalStack {
    _container: ContainerAsync<GenericImage>,
    pub endpoint_url: String,
}

static LOCALSTACK: OnceCell<LocalStack> = OnceCell::const_new();

impl LocalStack {
    /// Shared instance, started on first use.
    pub async fn shared() -> &'static LocalStack {
        LOCALSTACK.get_or_init(LocalStack::start).await
    }

    async fn start() -> LocalStack {
        println!("Starting LocalStack (sns, sqs)...");
        let container = GenericImage::new("localstack/localstack", "latest")
            .with_exposed_port(LOCALSTACK_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready."))
            .with_env_var("SERVICES", "sns,sqs")
            .with_env_var("AWS_DEFAULT_REGION", REGION)
            .with_env_var("EAGER_SERVICE_LOADING", "1")
            .with_env_var("LOCALSTACK_HOST", "localhost")
            .with_startup_timeout(Duration::from_secs(180))
            .start()
            .await
            .expect("Failed to start localstack container");

        let host = container
            .get_host()
            .await
            .expect("Failed to get container host");
        let port = container
            .get_host_port_ipv4(LOCALSTACK_PORT)
            .await
            .expect("Failed to get mapped port");
        let endpoint_url = format!("http://{}:{}", host, port);

        let localstack = LocalStack {
            _container: container,
            endpoint_url,
        };
        localstack.wait_until_serving().await;
        println!("LocalStack serving at {}", localstack.endpoint_url);
        localstack
    }

    /// "Ready." is logged before SQS answers; poll it until it does.
    async fn wait_until_serving(&self) {
        let sqs = aws_sdk_sqs::Client::new(&self.sdk_config().await);
        let sqs = &sqs;
        (move || async move { sqs.list_queues().send().await })
            .retry(connection_backoff())
            .await
            .expect("LocalStack SQS never became available");
    }

    /// SDK config pointed at the container with dummy credentials.
    pub async fn sdk_config(&self) -> SdkConfig {
        std::env::set_var("AWS_ACCESS_KEY_ID", "test");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");

        aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(REGION))
            .endpoint_url(&self.endpoint_url)
            .load()
            .await
    }
}

/// Topic, main queue and DLQ wired together the way the worker expects.
pub struct Fixture {
    pub gateway: SnsSqsGateway,
    pub topic_arn: String,
    pub queue_url: String,
    pub dlq_url: String,
}

/// Provision a topic fanned out to a queue that redrives to a DLQ after
/// three receives.
///
/// The worker never provisions; tests do it with raw SDK clients.
pub async fn provision(name: &str, visibility_timeout_secs: u32) -> Fixture {
    let localstack = LocalStack::shared().await;
    let aws = localstack.sdk_config().await;
    let sns = aws_sdk_sns::Client::new(&aws);
    let sqs = aws_sdk_sqs::Client::new(&aws);
    let suffix = uuid::Uuid::new_v4().simple().to_string();

    let topic_arn = sns
        .create_topic()
        .name(format!("{}-topic-{}", name, suffix))
        .send()
        .await
        .expect("create topic")
        .topic_arn()
        .map(str::to_string)
        .expect("topic arn");

    let dlq_url = create_queue(&sqs, &format!("{}-dlq-{}", name, suffix), Vec::new()).await;
    let redrive = serde_json::json!({
        "deadLetterTargetArn": queue_arn(&sqs, &dlq_url).await,
        "maxReceiveCount": "3",
    })
    .to_string();

    let queue_url = create_queue(
        &sqs,
        &format!("{}-queue-{}", name, suffix),
        vec![
            (
                QueueAttributeName::VisibilityTimeout,
                visibility_timeout_secs.to_string(),
            ),
            (QueueAttributeName::RedrivePolicy, redrive),
        ],
    )
    .await;

    sns.subscribe()
        .topic_arn(&topic_arn)
        .protocol("sqs")
        .endpoint(queue_arn(&sqs, &queue_url).await)
        .attributes("RawMessageDelivery", "true")
        .send()
        .await
        .expect("subscribe queue");

    let gateway = SnsSqsGateway::new(
        SnsSqsConfig::new()
            .with_region(REGION)
            .with_endpoint(&localstack.endpoint_url),
    )
    .await
    .expect("Failed to create gateway");

    Fixture {
        gateway,
        topic_arn,
        queue_url,
        dlq_url,
    }
}

async fn create_queue(
    sqs: &aws_sdk_sqs::Client,
    name: &str,
    attributes: Vec<(QueueAttributeName, String)>,
) -> String {
    attributes
        .into_iter()
        .fold(sqs.create_queue().queue_name(name), |req, (key, value)| {
            req.attributes(key, value)
        })
        .send()
        .await
        .expect("create queue")
        .queue_url()
        .map(str::to_string)
        .expect("queue url")
}

async fn queue_arn(sqs: &aws_sdk_sqs::Client, url: &str) -> String {
    sqs.get_queue_attributes()
        .queue_url(url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .expect("get queue attributes")
        .attributes()
        .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn).cloned())
        .expect("queue arn")
}
