use super::*;

#[tokio::test]
async fn test_empty_queue_has_no_task() {
    let queue = TaskQueue::new();
    assert!(queue.is_empty());
    assert!(queue.next_task().await.unwrap().is_none());
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let queue = TaskQueue::new();
    queue.push(TaskContext::new("a", "first low"));
    queue.push(TaskContext::new("b", "urgent").with_priority(5));
    queue.push(TaskContext::new("c", "second low"));
    queue.push(TaskContext::new("d", "also urgent").with_priority(5));

    let mut order = Vec::new();
    while let Some(task) = queue.next_task().await.unwrap() {
        assert!(queue.complete(&task.id));
        order.push(task.id);
    }
    assert_eq!(order, vec!["b", "d", "a", "c"]);
}

#[tokio::test]
async fn test_next_task_does_not_consume() {
    let queue = TaskQueue::new();
    queue.push(TaskContext::new("x", "research rust"));
    assert_eq!(queue.next_task().await.unwrap().unwrap().id, "x");
    assert_eq!(queue.len(), 1);
    assert!(!queue.complete("missing"));
    assert!(queue.complete("x"));
    assert!(queue.is_empty());
}
