//! Scripts injected into pages by the lifecycle tracker.

/// Forwards `console.*` calls to the host through the message bridge.
pub const CONSOLE_BRIDGE_JS: &str = r#"
(function() {
  var levels = ['log', 'debug', 'info', 'warn', 'error'];
  levels.forEach(function(level) {
    var original = console[level];
    console[level] = function() {
      var message = Array.prototype.slice.call(arguments).map(function(arg) {
        try { return typeof arg === 'string' ? arg : JSON.stringify(arg); }
        catch (e) { return String(arg); }
      }).join(' ');
      if (window.webviewBridge) {
        window.webviewBridge._post('onConsoleMessage', { level: level, message: message });
      }
      original.apply(console, arguments);
    };
  });
})();
"#;

/// Defines `window.webviewBridge`, the page-side end of the message bridge.
pub const MESSAGE_BRIDGE_JS: &str = r#"
(function() {
  if (window.webviewBridge) { return; }
  var nextId = 1;
  var pending = {};
  window.webviewBridge = {
    callHandler: function(name) {
      var args = Array.prototype.slice.call(arguments, 1);
      var id = nextId++;
      return new Promise(function(resolve) {
        pending[id] = resolve;
        window.webviewBridge._post('callHandler', { id: id, handlerName: name, args: JSON.stringify(args) });
      });
    },
    _resolve: function(id, value) {
      var resolve = pending[id];
      delete pending[id];
      if (resolve) { resolve(value); }
    },
    _post: function(method, data) {
      if (window.__webviewBridgeNative) {
        window.__webviewBridgeNative.postMessage(JSON.stringify({ method: method, data: data }));
      }
    }
  };
})();
"#;

/// Announces that the message bridge is usable.
pub const PLATFORM_READY_JS: &str = r#"
window.dispatchEvent(new Event('webviewBridgePlatformReady'));
"#;

/// Reports every loaded resource through the message bridge.
pub const RESOURCE_OBSERVER_JS: &str = r#"
(function() {
  if (typeof PerformanceObserver === 'undefined') { return; }
  var observer = new PerformanceObserver(function(list) {
    list.getEntries().forEach(function(entry) {
      if (window.webviewBridge) {
        window.webviewBridge._post('onLoadResource', {
          initiatorType: entry.initiatorType,
          url: entry.name,
          startTime: entry.startTime,
          duration: entry.duration
        });
      }
    });
  });
  observer.observe({ entryTypes: ['resource'] });
})();
"#;

/// Collapses `script` onto one line for `javascript:` URL injection.
pub fn single_line(script: &str) -> String {
    script
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_strips_newlines() {
        let flattened = single_line(RESOURCE_OBSERVER_JS);
        assert!(!flattened.contains('\n'));
        assert!(!flattened.contains('\r'));
        assert!(flattened.starts_with("(function()"));
    }
}
