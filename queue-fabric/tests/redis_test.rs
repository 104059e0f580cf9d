use std::time::Duration;

use queue_fabric::{BrokerManagement, QueueFabric, RedisQueueFabric};

async fn fabric() -> Option<RedisQueueFabric> {
    let redis_url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("REDIS_URL not set, skipping redis queue test");
            return None;
        }
    };
    Some(RedisQueueFabric::new(redis_url).await.unwrap())
}

#[tokio::test]
async fn unacked_messages_survive_a_crashed_consumer() {
    let Some(fabric) = fabric().await else {
        return;
    };
    let queue = "test:redis_fabric:recovery";
    fabric.delete(queue).await.unwrap();
    fabric
        .publish_batch(queue, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()])
        .await
        .unwrap();

    {
        let mut consumer = fabric.consumer(queue, "worker-1").await.unwrap();
        let batch = consumer.fetch(2, Duration::from_millis(200)).await.unwrap();
        assert_eq!(batch.len(), 2);
        consumer.ack(&batch[..1]).await.unwrap();
        // dropped without ack or cancel
    }
    let info = fabric.queue_info(queue).await.unwrap();
    assert_eq!((info.messages, info.consumers), (2, 1));

    assert_eq!(fabric.recover(queue).await.unwrap(), 1);
    let mut consumer = fabric.consumer(queue, "worker-2").await.unwrap();
    let batch = consumer.fetch(10, Duration::from_millis(200)).await.unwrap();
    let payloads: Vec<Vec<u8>> = batch.iter().map(|d| d.payload.clone()).collect();
    assert_eq!(payloads, vec![b"2".to_vec(), b"3".to_vec()]);

    consumer.reject(&batch[1..], true).await.unwrap();
    consumer.ack(&batch[..1]).await.unwrap();
    consumer.cancel().await.unwrap();
    let info = fabric.queue_info(queue).await.unwrap();
    assert_eq!((info.messages, info.consumers), (1, 0));
    fabric.delete(queue).await.unwrap();
}

#[tokio::test]
async fn released_consumer_hands_back_its_batch() {
    let Some(fabric) = fabric().await else {
        return;
    };
    let queue = "test:redis_fabric:release";
    fabric.delete(queue).await.unwrap();
    fabric
        .publish_batch(queue, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()])
        .await
        .unwrap();

    let mut survivor = fabric.consumer(queue, "ingestor-2").await.unwrap();
    {
        let mut consumer = fabric.consumer(queue, "ingestor-1").await.unwrap();
        let batch = consumer.fetch(2, Duration::from_millis(200)).await.unwrap();
        assert_eq!(batch.len(), 2);
    }
    assert_eq!(fabric.release(queue, "ingestor-1").await.unwrap(), 2);
    let info = fabric.queue_info(queue).await.unwrap();
    assert_eq!((info.messages, info.consumers), (3, 1));

    let batch = survivor.fetch(10, Duration::from_millis(200)).await.unwrap();
    let payloads: Vec<Vec<u8>> = batch.iter().map(|d| d.payload.clone()).collect();
    assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    survivor.ack(&batch).await.unwrap();
    survivor.cancel().await.unwrap();
    fabric.delete(queue).await.unwrap();
}
